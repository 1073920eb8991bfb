//!
//! Page guard
//! ----------
//! The render-time access check for server-rendered pages. It reads the
//! client's session-store snapshot, while the edge middleware revalidates
//! credentials with the provider, and both sides reduce role questions to
//! the same policy functions, so for any settled (profile, route) pair the
//! two tiers reach the same verdict. The page guard exists for what the
//! middleware cannot see: state that changed after the request was admitted.

use crate::identity::AuthState;
use crate::policy;

use super::routes::{RouteClass, RouteTable};

/// Verdict for rendering one page from one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAccess {
    Granted,
    /// No usable session: send the visitor to the entry page, preserving
    /// where they were headed.
    SignInRequired,
    /// Authenticated but lacking the required role: plain redirect home,
    /// with no hint about what lives at the path.
    Denied,
    /// Authenticated, role required, profile still loading. Render a
    /// holding page rather than guessing.
    Pending,
}

pub fn evaluate(snapshot: &AuthState, class: &RouteClass) -> PageAccess {
    let required = match class {
        RouteClass::Public => return PageAccess::Granted,
        RouteClass::Protected { required, .. } => required,
    };
    if snapshot.session.is_none() || snapshot.user.is_none() {
        return PageAccess::SignInRequired;
    }
    if required.is_empty() {
        return PageAccess::Granted;
    }
    if policy::has_any_role(snapshot.profile.as_ref(), required) {
        return PageAccess::Granted;
    }
    if snapshot.profile.is_none() && snapshot.loading {
        return PageAccess::Pending;
    }
    PageAccess::Denied
}

/// Classify `path` against the table and evaluate the snapshot in one step.
pub fn check_page(snapshot: &AuthState, routes: &RouteTable, path: &str) -> PageAccess {
    evaluate(snapshot, &routes.classify(path))
}
