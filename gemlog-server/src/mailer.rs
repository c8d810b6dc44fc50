use anyhow::Context;

/// Sends the welcome notification of freshly registered users
///
/// Delivery happens in the background: registration never waits on it
/// nor fails because of it.
#[derive(Clone, Debug)]
pub struct Mailer {
    webhook: Option<String>,
    client: reqwest::Client,
}

impl Mailer {
    pub fn new(webhook: Option<String>) -> Mailer {
        Mailer {
            webhook,
            client: reqwest::Client::new(),
        }
    }

    pub fn send_welcome(&self, email: String, username: String) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.deliver_welcome(&email, &username).await {
                tracing::warn!(?err, email, "failed sending welcome notification");
            }
        });
    }

    async fn deliver_welcome(&self, email: &str, username: &str) -> anyhow::Result<()> {
        let Some(webhook) = &self.webhook else {
            tracing::info!(email, "no welcome webhook configured, skipping notification");
            return Ok(());
        };
        self.client
            .post(webhook)
            .json(&serde_json::json!({
                "to": email,
                "subject": "Welcome to GemLog",
                "text": format!("Hi {username}, thanks for joining GemLog!"),
            }))
            .send()
            .await
            .context("posting welcome notification")?
            .error_for_status()
            .context("welcome webhook refused the notification")?;
        tracing::debug!(email, "sent welcome notification");
        Ok(())
    }
}
