//! Per-board access-list evaluation.
//!
//! A board may carry an allow-list of usernames.  The rules are:
//!
//! - no list configured → the board is open to every session, including
//!   sessions that did not present a username at all;
//! - list configured but the session has no username → denied;
//! - otherwise → allowed iff the username is on the list.
//!
//! The same check gates board selection, `list-devices` visibility, and
//! `board-info` lookups, so it lives here rather than in the server.

/// Returns whether a session identified by `username` may use a board whose
/// configuration carries `access_list`.
///
/// # Examples
///
/// ```rust
/// use boardd_core::access_allowed;
///
/// assert!(access_allowed(None, None));
/// assert!(access_allowed(Some(&["alice".into()]), Some("alice")));
/// assert!(!access_allowed(Some(&["alice".into()]), Some("mallory")));
/// assert!(!access_allowed(Some(&["alice".into()]), None));
/// ```
pub fn access_allowed(access_list: Option<&[String]>, username: Option<&str>) -> bool {
    let Some(users) = access_list else {
        return true;
    };

    let Some(username) = username else {
        return false;
    };

    users.iter().any(|u| u == username)
}
