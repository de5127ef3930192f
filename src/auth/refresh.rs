// Token renewal call

use anyhow::{Context, Result};
use reqwest::{Client, Url};

use super::types::{IssuedTokens, RenewalRequest, RenewalResponse};

/// Exchange a refresh token for a new token pair.
///
/// The call is made without credentials. A non-success status, an unparsable
/// body or a response missing any of `token`, `refresh_token` and
/// `expires_in` is an error.
pub async fn request_renewal(
    client: &Client,
    renewal_url: &Url,
    refresh_token: &str,
) -> Result<IssuedTokens> {
    tracing::info!("Renewing access token...");
    let prefix: String = refresh_token.chars().take(8).collect();
    tracing::debug!(url = %renewal_url, refresh_token = %prefix, "Renewal request");

    let response = client
        .post(renewal_url.clone())
        .json(&RenewalRequest { refresh_token })
        .send()
        .await
        .context("Failed to send renewal request")?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        anyhow::bail!("Token renewal failed: {} - {}", status, error_text);
    }

    let data: RenewalResponse = response
        .json()
        .await
        .context("Failed to parse renewal response")?;

    let tokens = data
        .into_tokens()
        .context("Renewal response is missing token, refresh_token or expires_in")?;

    tracing::info!(expires_in = tokens.expires_in, "Access token renewed");
    Ok(tokens)
}
