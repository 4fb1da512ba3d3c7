//! Client launch links for assigned desktops.

use error_stack::Report;
use error_stack::ResultExt;
use url::Url;

use super::error::AllocationError;

const SCHEME_BASE: &str = "ms-avd:connect";
const CLIENT_ENV: &str = "avdarm";
const CLIENT_VERSION: &str = "0";

/// Builds the `ms-avd:connect` link that opens `desktop_object_id` in
/// `workspace_object_id` for `username`. Parameter values are
/// percent-encoded.
pub fn connection_url(
    workspace_object_id: &str,
    desktop_object_id: &str,
    username: &str,
) -> Result<Url, Report<AllocationError>> {
    let mut url = Url::parse(SCHEME_BASE).change_context_lazy(|| AllocationError::InvalidRequest {
        reason: format!("cannot build connection link from `{SCHEME_BASE}`"),
    })?;
    url.query_pairs_mut()
        .append_pair("workspaceId", workspace_object_id)
        .append_pair("resourceid", desktop_object_id)
        .append_pair("username", username)
        .append_pair("env", CLIENT_ENV)
        .append_pair("version", CLIENT_VERSION);
    Ok(url)
}
