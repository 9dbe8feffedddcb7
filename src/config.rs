use std::env;

/// Everything the server reads from the environment, collected once at
/// startup. Any value may be missing: endpoints that need a missing value
/// answer 500 instead of the process refusing to boot.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub evolution_api_url: String,
    pub evolution_api_key: String,
    pub evolution_instance: String,
    pub openai_api_key: String,
    pub openai_chat_model: String,
    pub upstash_redis_rest_url: String,
    pub upstash_redis_rest_token: String,
    pub baserow_api_url: String,
    pub baserow_api_token: String,
    pub baserow_leads_table_id: String,
    pub baserow_properties_table_id: String,
    pub calendly_api_key: String,
    pub calendly_event_type: String,
    pub calendly_public_link: String,
    pub realtor_phone: String,
    pub site_base_url: String,
    pub port: u16,
}

fn env_text(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);
        Self {
            evolution_api_url: env_text("EVOLUTION_API_URL")
                .trim_end_matches('/')
                .to_string(),
            evolution_api_key: env_text("EVOLUTION_API_KEY"),
            evolution_instance: env_text("EVOLUTION_INSTANCE"),
            openai_api_key: env_text("OPENAI_API_KEY"),
            openai_chat_model: {
                let model = env_text("OPENAI_CHAT_MODEL");
                if model.is_empty() {
                    "gpt-4o-mini".to_string()
                } else {
                    model
                }
            },
            upstash_redis_rest_url: env_text("UPSTASH_REDIS_REST_URL")
                .trim_end_matches('/')
                .to_string(),
            upstash_redis_rest_token: env_text("UPSTASH_REDIS_REST_TOKEN"),
            baserow_api_url: {
                let url = env_text("BASEROW_API_URL");
                if url.is_empty() {
                    "https://api.baserow.io".to_string()
                } else {
                    url.trim_end_matches('/').to_string()
                }
            },
            baserow_api_token: env_text("BASEROW_API_TOKEN"),
            baserow_leads_table_id: env_text("BASEROW_LEADS_TABLE_ID"),
            baserow_properties_table_id: env_text("BASEROW_PROPERTIES_TABLE_ID"),
            calendly_api_key: env_text("CALENDLY_API_KEY"),
            calendly_event_type: env_text("CALENDLY_EVENT_TYPE"),
            calendly_public_link: env_text("CALENDLY_PUBLIC_LINK"),
            realtor_phone: env_text("REALTOR_PHONE"),
            site_base_url: env_text("SITE_BASE_URL")
                .trim_end_matches('/')
                .to_string(),
            port,
        }
    }

    pub fn evolution_configured(&self) -> bool {
        !self.evolution_api_url.is_empty()
            && !self.evolution_api_key.is_empty()
            && !self.evolution_instance.is_empty()
    }

    pub fn baserow_configured(&self) -> bool {
        !self.baserow_api_token.is_empty()
    }

    pub fn upstash_configured(&self) -> bool {
        !self.upstash_redis_rest_url.is_empty() && !self.upstash_redis_rest_token.is_empty()
    }
}
