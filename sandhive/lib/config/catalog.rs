//! The tenant catalog: tiers, teams and the templates they may launch.

use std::{path::Path, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{SandhiveError, SandhiveResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Tiers, teams and templates known to the control plane.
#[derive(Debug, Default, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Catalog {
    /// The subscription tiers.
    #[serde(default)]
    #[builder(default)]
    tiers: Vec<Tier>,

    /// The teams.
    #[serde(default)]
    #[builder(default)]
    teams: Vec<Team>,

    /// The templates.
    #[serde(default)]
    #[builder(default)]
    templates: Vec<Template>,
}

/// A subscription tier.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Tier {
    /// The tier id.
    #[builder(setter(into))]
    id: String,

    /// How many sandboxes a team on this tier may run at once.
    concurrent_instances: usize,

    /// How many hours a sandbox may live.
    max_length_hours: u64,
}

/// A team and its credentials.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Team {
    /// The team id.
    #[builder(setter(into))]
    id: String,

    /// The API key the team authenticates with.
    #[builder(setter(into))]
    api_key: String,

    /// The tier id.
    #[builder(setter(into))]
    tier: String,
}

/// A sandbox template.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Template {
    /// The template id, also the directory name under the envs root.
    #[builder(setter(into))]
    id: String,

    /// The owning team.
    #[builder(setter(into))]
    team_id: String,

    /// Whether every team may launch it.
    #[serde(default)]
    #[builder(default)]
    public: bool,

    /// Alternative names.
    #[serde(default)]
    #[builder(default)]
    aliases: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Catalog {
    /// Loads a catalog from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> SandhiveResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw).map_err(|e| {
            SandhiveError::InvalidConfig(format!("catalog {}: {}", path.display(), e))
        })
    }

    /// Parses a catalog from TOML.
    pub fn from_toml_str(raw: &str) -> SandhiveResult<Self> {
        let catalog: Catalog =
            toml::from_str(raw).map_err(|e| SandhiveError::InvalidConfig(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Finds the team owning an API key.
    pub fn team_by_api_key(&self, api_key: &str) -> Option<&Team> {
        self.teams.iter().find(|t| t.api_key == api_key)
    }

    /// Finds a team by id.
    pub fn team(&self, team_id: &str) -> Option<&Team> {
        self.teams.iter().find(|t| t.id == team_id)
    }

    /// Finds a template by id.
    pub fn template(&self, template_id: &str) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == template_id)
    }

    /// Returns the tier of a team.
    pub fn tier_for(&self, team: &Team) -> SandhiveResult<&Tier> {
        self.tiers.iter().find(|t| t.id == team.tier).ok_or_else(|| {
            SandhiveError::InvalidConfig(format!("team {} has unknown tier {}", team.id, team.tier))
        })
    }

    /// Resolves a template id or alias for a team.
    ///
    /// Unknown ids are rejected as invalid, private templates of another team as forbidden.
    pub fn resolve_template(&self, team: &Team, id_or_alias: &str) -> SandhiveResult<&Template> {
        let template = self
            .templates
            .iter()
            .find(|t| t.id == id_or_alias)
            .or_else(|| {
                self.templates
                    .iter()
                    .find(|t| t.aliases.iter().any(|a| a == id_or_alias))
            })
            .ok_or_else(|| SandhiveError::InvalidTemplate(id_or_alias.to_string()))?;

        if !template.public && template.team_id != team.id {
            return Err(SandhiveError::TemplateForbidden(id_or_alias.to_string()));
        }

        Ok(template)
    }

    fn validate(&self) -> SandhiveResult<()> {
        for team in &self.teams {
            self.tier_for(team)?;
        }
        Ok(())
    }
}

impl Tier {
    /// The maximum lifetime of a sandbox on this tier.
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_length_hours.saturating_mul(60 * 60))
    }
}

impl Template {
    /// The first alias, if any.
    pub fn first_alias(&self) -> Option<&str> {
        self.aliases.first().map(String::as_str)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [[tiers]]
        id = "base"
        concurrent_instances = 2
        max_length_hours = 24

        [[teams]]
        id = "T"
        api_key = "key-t"
        tier = "base"

        [[teams]]
        id = "U"
        api_key = "key-u"
        tier = "base"

        [[templates]]
        id = "tpl_abc"
        team_id = "T"
        aliases = ["python"]

        [[templates]]
        id = "tpl_pub"
        team_id = "U"
        public = true
    "#;

    #[test]
    fn test_catalog_resolves_templates() -> anyhow::Result<()> {
        let catalog = Catalog::from_toml_str(CATALOG)?;
        let t = catalog.team_by_api_key("key-t").expect("team T");
        let u = catalog.team("U").expect("team U");

        assert_eq!(catalog.resolve_template(t, "tpl_abc")?.get_id(), "tpl_abc");
        assert_eq!(catalog.resolve_template(t, "python")?.get_id(), "tpl_abc");
        assert_eq!(catalog.resolve_template(t, "tpl_pub")?.get_id(), "tpl_pub");
        assert_eq!(catalog.template("tpl_pub").map(|t| t.get_team_id().as_str()), Some("U"));
        assert!(catalog.template("python").is_none());
        assert!(matches!(
            catalog.resolve_template(u, "tpl_abc"),
            Err(SandhiveError::TemplateForbidden(_))
        ));
        assert!(matches!(
            catalog.resolve_template(t, "nope"),
            Err(SandhiveError::InvalidTemplate(_))
        ));

        let tier = catalog.tier_for(t)?;
        assert_eq!(tier.get_concurrent_instances(), &2);
        assert_eq!(tier.max_lifetime(), Duration::from_secs(86_400));
        Ok(())
    }

    #[test]
    fn test_catalog_rejects_unknown_tier() {
        let raw = r#"
            [[teams]]
            id = "T"
            api_key = "k"
            tier = "missing"
        "#;
        assert!(matches!(
            Catalog::from_toml_str(raw),
            Err(SandhiveError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_tier_lifetime_saturates() -> anyhow::Result<()> {
        let raw = format!(
            r#"
            [[tiers]]
            id = "forever"
            concurrent_instances = 1
            max_length_hours = {}

            [[teams]]
            id = "T"
            api_key = "k"
            tier = "forever"
            "#,
            i64::MAX
        );
        let catalog = Catalog::from_toml_str(&raw)?;
        let tier = catalog.tier_for(catalog.team("T").expect("team T"))?;
        assert_eq!(tier.max_lifetime(), Duration::from_secs(u64::MAX));
        Ok(())
    }
}
