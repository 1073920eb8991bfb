//! Pure authorization policy.
//!
//! Both enforcement tiers (the route guard middleware and the render-time
//! page guard) call into this module and nowhere else for role decisions, so
//! the two checks cannot drift apart. Every function is total over its
//! inputs: an absent profile is an empty role set, never a panic.

use crate::profile::Profile;
use crate::roles::Role;

pub fn has_role(profile: Option<&Profile>, role: Role) -> bool {
    match profile {
        Some(p) => p.user_types.contains(&role),
        None => false,
    }
}

/// Logical OR across the required set. An empty requirement grants nothing;
/// "authenticated with no role constraint" is decided before this is called.
pub fn has_any_role(profile: Option<&Profile>, required: &[Role]) -> bool {
    required.iter().any(|r| has_role(profile, *r))
}

/// Monastery administration tier: monastery_admin or super_admin.
pub fn is_admin(profile: Option<&Profile>) -> bool {
    has_role(profile, Role::MonasteryAdmin) || has_role(profile, Role::SuperAdmin)
}

pub fn is_super_admin(profile: Option<&Profile>) -> bool {
    has_role(profile, Role::SuperAdmin)
}
