//! OAuth2 authentication for the Gmail API

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};
use std::path::Path;

use crate::error::{MailboxError, Result};

/// Permanent deletion needs the full mail scope; gmail.modify only allows trashing
pub const REQUIRED_SCOPES: &[&str] = &["https://mail.google.com/"];

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub = Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Initialize Gmail API hub with OAuth2 authentication
///
/// Uses the installed-application flow with tokens persisted to
/// `token_cache_path`, so later runs refresh silently.
///
/// # Arguments
/// * `credentials_path` - Path to the OAuth2 client secrets JSON file
/// * `token_cache_path` - Path where access tokens will be cached
pub async fn initialize_gmail_hub(credentials_path: &Path, token_cache_path: &Path) -> Result<GmailHub> {
    let secret = yup_oauth2::read_application_secret(credentials_path)
        .await
        .map_err(|e| MailboxError::AuthError(format!("Failed to read credentials: {}", e)))?;

    let auth = yup_oauth2::InstalledFlowAuthenticator::builder(
        secret,
        yup_oauth2::InstalledFlowReturnMethod::HTTPRedirect,
    )
    .persist_tokens_to_disk(token_cache_path)
    .build()
    .await
    .map_err(|e| MailboxError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    // Obtain the token up front so the browser prompt happens before the run starts
    let _token = auth
        .token(REQUIRED_SCOPES)
        .await
        .map_err(|e| MailboxError::AuthError(format!("Failed to obtain token: {}", e)))?;

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| MailboxError::AuthError(format!("Failed to load TLS roots: {}", e)))?
                .https_or_http()
                .enable_http1()
                .build(),
        );

    Ok(Gmail::new(client, auth))
}
