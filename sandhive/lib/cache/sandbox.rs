use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{config::DEFAULT_MAX_LIFETIME, SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A sandbox the cache believes to be running.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Sandbox {
    /// The sandbox id. Also the MMDS `instanceID`.
    #[builder(setter(into))]
    sandbox_id: String,

    /// The template the sandbox was restored from.
    #[builder(setter(into))]
    template_id: String,

    /// The template alias the sandbox was requested by.
    #[builder(default, setter(into))]
    alias: Option<String>,

    /// The owning team.
    #[builder(setter(into))]
    team_id: String,

    /// The short id of the node running the sandbox.
    #[builder(setter(into))]
    client_id: String,

    /// When the sandbox started. Filled in by the cache when unset.
    #[builder(default, setter(strip_option))]
    start_time: Option<DateTime<Utc>>,

    /// Caller-supplied metadata.
    #[builder(default)]
    metadata: HashMap<String, String>,

    /// How long the sandbox may live in total.
    #[builder(default = DEFAULT_MAX_LIFETIME)]
    max_lifetime: Duration,

    /// The pid of the VMM's supervising process.
    #[builder(default)]
    pid: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Sandbox {
    /// Fails with [`SandhiveError::InvalidSandbox`] if an identifying field is empty.
    pub fn validate(&self) -> SandhiveResult<()> {
        for (field, value) in [
            ("team_id", &self.team_id),
            ("sandbox_id", &self.sandbox_id),
            ("client_id", &self.client_id),
            ("template_id", &self.template_id),
        ] {
            if value.trim().is_empty() {
                return Err(SandhiveError::InvalidSandbox(format!("{field} is empty")));
            }
        }

        Ok(())
    }

    pub(crate) fn set_start_time(&mut self, start_time: DateTime<Utc>) {
        self.start_time = Some(start_time);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
