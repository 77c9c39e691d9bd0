//! Login surface rendering
//!
//! Page rendering is a collaborator: the engine hands a [`Templates`]
//! implementation everything the page needs and receives HTML back.
//! [`BuiltinTemplates`] is a plain, dependency-free rendition so the broker
//! works out of the box; deployments replace it for branding.

use crate::session::{Identity, Login};
use crate::storage::OAuth2Provider;

/// Data for the consent page served at `/auth`.
#[derive(Debug, Clone)]
pub struct ConsentData {
    /// Server display name
    pub display_name: String,
    /// Host of the requesting relying party
    pub client_host: String,
    /// All identities in the session
    pub identities: Vec<Identity>,
    /// Identities not yet used with this relying party
    pub remaining_identities: Vec<Identity>,
    /// Prior approvals for this relying party, newest first
    pub previous_logins: Vec<Login>,
    /// Configured upstream providers
    pub providers: Vec<OAuth2Provider>,
    /// URI to bounce back to after an upstream login
    pub return_uri: String,
    /// Whether email magic-link login is available
    pub can_email: bool,
}

/// Data for the FedCM provider chooser.
#[derive(Debug, Clone)]
pub struct FedCmData {
    /// Server display name
    pub display_name: String,
    /// All identities in the session
    pub identities: Vec<Identity>,
}

/// Renders the HTML surfaces the broker serves to browsers.
pub trait Templates: Send + Sync {
    /// The consent page: pick an identity or start an upstream login.
    fn consent(&self, data: &ConsentData) -> String;
    /// The FedCM provider chooser.
    fn fedcm_chooser(&self, data: &FedCmData) -> String;
    /// Shown when a non-public server rejects an unknown email.
    fn no_account(&self, return_uri: &str) -> String;
}

/// Unstyled built-in pages.
pub struct BuiltinTemplates;

impl BuiltinTemplates {
    fn page(title: &str, body: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>\n{}\n</body>\n</html>",
            escape(title),
            body
        )
    }
}

impl Templates for BuiltinTemplates {
    fn consent(&self, data: &ConsentData) -> String {
        let mut body = format!(
            "<h1>{}</h1>\n<p><strong>{}</strong> is asking you to log in.</p>\n",
            escape(&data.display_name),
            escape(&data.client_host)
        );

        if !data.previous_logins.is_empty() {
            body.push_str("<h2>Log in again as</h2>\n");
            for login in &data.previous_logins {
                body.push_str(&approve_form(&login.id, &login.provider_name));
            }
        }

        if !data.remaining_identities.is_empty() {
            body.push_str("<h2>Log in as</h2>\n");
            for ident in &data.remaining_identities {
                body.push_str(&approve_form(&ident.id, &ident.provider_name));
            }
        }

        body.push_str("<h2>Add an identity</h2>\n");
        for provider in &data.providers {
            body.push_str(&format!(
                "<p><a href=\"/login-oauth2?oauth2_provider_id={}\">{}</a></p>\n",
                escape(&provider.id),
                escape(&provider.name)
            ));
        }
        if data.can_email {
            body.push_str("<p><a href=\"/login-email\">Email a login link</a></p>\n");
        }

        Self::page(&data.display_name, &body)
    }

    fn fedcm_chooser(&self, data: &FedCmData) -> String {
        let mut body = format!("<h1>{}</h1>\n", escape(&data.display_name));
        if data.identities.is_empty() {
            body.push_str("<p>No identities yet.</p>\n");
        } else {
            body.push_str("<ul>\n");
            for ident in &data.identities {
                body.push_str(&format!(
                    "<li>{} ({})</li>\n",
                    escape(&ident.id),
                    escape(&ident.provider_name)
                ));
            }
            body.push_str("</ul>\n");
        }
        body.push_str(
            "<form method=\"post\" action=\"/complete-login-fedcm\">\
             <input type=\"hidden\" name=\"fedcm-token\" id=\"fedcm-token\">\
             <button type=\"submit\">Continue</button></form>\n",
        );
        Self::page(&data.display_name, &body)
    }

    fn no_account(&self, return_uri: &str) -> String {
        let body = format!(
            "<h1>No account</h1>\n<p>This server is private and your email is not on its user list.</p>\n<p><a href=\"{}\">Back</a></p>",
            escape(return_uri)
        );
        Self::page("No account", &body)
    }
}

fn approve_form(identity_id: &str, provider_name: &str) -> String {
    format!(
        "<form method=\"post\" action=\"/approve\">\
         <input type=\"hidden\" name=\"identity_id\" value=\"{}\">\
         <button type=\"submit\">{} ({})</button></form>\n",
        escape(identity_id),
        escape(identity_id),
        escape(provider_name)
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
