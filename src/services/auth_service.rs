use async_trait::async_trait;
use upload_queue::{AuthProvider, AuthToken, WebDavSettings};

/// Credential taken from the configuration file
pub struct ConfigAuth {
    token: Option<AuthToken>,
}

impl ConfigAuth {
    pub fn from_settings(settings: &WebDavSettings) -> Self {
        let password = settings.app_password.trim();
        if password.is_empty() {
            log::warn!("No app password configured, uploads will wait for a credential");
        }
        Self {
            token: (!password.is_empty()).then(|| AuthToken::new(password)),
        }
    }
}

#[async_trait]
impl AuthProvider for ConfigAuth {
    async fn auth_token(&self) -> Option<AuthToken> {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(password: &str) -> WebDavSettings {
        WebDavSettings {
            server_url: "https://cloud.example.org".to_string(),
            username: "driver".to_string(),
            app_password: password.to_string(),
            remote_path: "/ExpenseSync".to_string(),
        }
    }

    #[tokio::test]
    async fn test_token_from_settings() {
        let auth = ConfigAuth::from_settings(&settings(" app-pass "));
        assert_eq!(auth.auth_token().await.unwrap().secret(), "app-pass");
        assert!(ConfigAuth::from_settings(&settings(""))
            .auth_token()
            .await
            .is_none());
    }
}
