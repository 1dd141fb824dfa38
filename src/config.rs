//! Configuration for the query engine
//!
//! Provides a builder pattern for configuring paging limits, the exposed
//! schema and the database roles used for row-level security.

/// Database roles used when scoping a transaction
#[derive(Debug, Clone)]
pub struct RoleConfig {
    /// Role for requests without an identity (default: "anon")
    pub anonymous: String,
    /// Role for ordinary signed-in users (default: "authenticated")
    pub authenticated: String,
    /// Role for privileged callers (default: "service_role")
    pub service: String,
    /// Application roles that map to the service role
    pub privileged_app_roles: Vec<String>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            anonymous: "anon".to_string(),
            authenticated: "authenticated".to_string(),
            service: "service_role".to_string(),
            privileged_app_roles: vec![
                "service_role".to_string(),
                "service".to_string(),
                "admin".to_string(),
            ],
        }
    }
}

impl RoleConfig {
    /// Map an application role to the database role it runs under
    ///
    /// Privileged roles map to the service role, an empty role to the
    /// anonymous role, and everything else to the authenticated role.
    pub fn database_role(&self, app_role: &str) -> &str {
        if app_role.is_empty() || app_role == self.anonymous {
            &self.anonymous
        } else if self.privileged_app_roles.iter().any(|r| r == app_role) {
            &self.service
        } else {
            &self.authenticated
        }
    }
}

/// Configuration for the query engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// PostgreSQL database URL
    pub database_url: String,
    /// Schema exposed through the API (default: "public")
    pub schema: String,
    /// Limit applied when a request gives none; 0 disables it (default: 100)
    pub default_limit: i64,
    /// Largest page a request may ask for; 0 disables the cap (default: 1000)
    pub max_limit: i64,
    /// Cap on `offset + limit`; 0 disables it (default: 0)
    pub max_total_results: i64,
    /// Below this planner estimate, `estimated` counts run exactly (default: 1000)
    pub estimated_count_threshold: i64,
    /// Session setting that carries the JSON claims (default: "request.jwt.claims")
    pub claims_setting: String,
    /// Role mapping for row-level security
    pub roles: RoleConfig,
}

impl EngineConfig {
    /// Create a new configuration builder
    pub fn builder(database_url: impl Into<String>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(database_url)
    }
}

/// Builder for EngineConfig
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with the database URL
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            config: EngineConfig {
                database_url: database_url.into(),
                schema: "public".to_string(),
                default_limit: 100,
                max_limit: 1000,
                max_total_results: 0,
                estimated_count_threshold: 1000,
                claims_setting: "request.jwt.claims".to_string(),
                roles: RoleConfig::default(),
            },
        }
    }

    /// Set the exposed schema (default: "public")
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.config.schema = schema.into();
        self
    }

    /// Set the default page size; 0 or less disables it
    pub fn default_limit(mut self, limit: i64) -> Self {
        self.config.default_limit = limit;
        self
    }

    /// Set the maximum page size; 0 or less disables the cap
    pub fn max_limit(mut self, limit: i64) -> Self {
        self.config.max_limit = limit;
        self
    }

    /// Cap `offset + limit`; 0 or less disables the cap
    pub fn max_total_results(mut self, total: i64) -> Self {
        self.config.max_total_results = total;
        self
    }

    /// Set the exact-count fallback threshold for `estimated` counts
    pub fn estimated_count_threshold(mut self, threshold: i64) -> Self {
        self.config.estimated_count_threshold = threshold;
        self
    }

    /// Set the session setting name used for claims
    pub fn claims_setting(mut self, name: impl Into<String>) -> Self {
        self.config.claims_setting = name.into();
        self
    }

    /// Replace the role mapping
    pub fn roles(mut self, roles: RoleConfig) -> Self {
        self.config.roles = roles;
        self
    }

    /// Build the configuration
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // EngineConfig Default Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = EngineConfig::builder("postgres://localhost/test").build();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.schema, "public");
        assert_eq!(config.default_limit, 100);
        assert_eq!(config.max_limit, 1000);
        assert_eq!(config.max_total_results, 0);
        assert_eq!(config.estimated_count_threshold, 1000);
        assert_eq!(config.claims_setting, "request.jwt.claims");
        assert_eq!(config.roles.anonymous, "anon");
    }

    #[test]
    fn test_builder_accepts_string() {
        let config = EngineConfig::builder(String::from("postgres://localhost/db")).build();
        assert_eq!(config.database_url, "postgres://localhost/db");
    }

    #[test]
    fn test_full_custom_config() {
        let config = EngineConfig::builder("postgres://localhost/test")
            .schema("api")
            .default_limit(0)
            .max_limit(50)
            .max_total_results(500)
            .estimated_count_threshold(10)
            .claims_setting("app.claims")
            .build();

        assert_eq!(config.schema, "api");
        assert_eq!(config.default_limit, 0);
        assert_eq!(config.max_limit, 50);
        assert_eq!(config.max_total_results, 500);
        assert_eq!(config.estimated_count_threshold, 10);
        assert_eq!(config.claims_setting, "app.claims");
    }

    // =========================================================================
    // RoleConfig Tests
    // =========================================================================

    #[test]
    fn test_database_role_mapping() {
        let roles = RoleConfig::default();

        assert_eq!(roles.database_role(""), "anon");
        assert_eq!(roles.database_role("anon"), "anon");
        assert_eq!(roles.database_role("service_role"), "service_role");
        assert_eq!(roles.database_role("admin"), "service_role");
        assert_eq!(roles.database_role("service"), "service_role");
        assert_eq!(roles.database_role("user"), "authenticated");
        assert_eq!(roles.database_role("editor"), "authenticated");
        assert_eq!(roles.database_role("postgres"), "authenticated");
    }

    #[test]
    fn test_custom_roles() {
        let roles = RoleConfig {
            anonymous: "web_anon".to_string(),
            authenticated: "web_user".to_string(),
            service: "web_admin".to_string(),
            privileged_app_roles: vec!["superuser".to_string()],
        };
        let config = EngineConfig::builder("postgres://localhost/test")
            .roles(roles)
            .build();

        assert_eq!(config.roles.database_role("superuser"), "web_admin");
        assert_eq!(config.roles.database_role("admin"), "web_user");
        assert_eq!(config.roles.database_role(""), "web_anon");
    }

    #[test]
    fn test_config_clone() {
        let config1 = EngineConfig::builder("postgres://localhost/test")
            .schema("custom")
            .build();
        let config2 = config1.clone();

        assert_eq!(config1.schema, config2.schema);
        assert_eq!(config1.max_limit, config2.max_limit);
    }
}
