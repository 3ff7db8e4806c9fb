//! Local participant-type resolution.
//!
//! Role must be known synchronously, before any transport exists, because
//! candidates are written to role-owned record fields the moment they are
//! generated. All ambient identity signals are gathered once into a
//! [`RoleContext`] and passed by reference from then on, so the resolved
//! role cannot drift mid-call.

use super::record::Role;
use log::warn;
use thiserror::Error;

/// Where the current view was entered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteHint {
    /// A route only a parent endpoint can reach.
    ParentOnly,
    /// A route only a child endpoint can reach.
    ChildOnly,
    /// No role information in the route.
    Neutral,
}

/// Ambient identity signals, captured once at page entry.
#[derive(Debug, Clone, Copy)]
pub struct RoleContext {
    pub route: RouteHint,
    /// A full authenticated session exists.
    pub authenticated_session: bool,
    /// A lightweight child device token exists.
    pub child_token: bool,
}

#[derive(Debug, Error)]
pub enum RoleError {
    #[error("no identity signal available to resolve a role")]
    Unresolvable,
}

/// Resolve the local role.
///
/// Precedence, highest first: explicit route context, then an
/// authenticated session (parent wins even if a stray child token is also
/// present), then a child token alone.
pub fn resolve(ctx: &RoleContext) -> Result<Role, RoleError> {
    match ctx.route {
        RouteHint::ParentOnly => return Ok(Role::Parent),
        RouteHint::ChildOnly => return Ok(Role::Child),
        RouteHint::Neutral => {}
    }
    if ctx.authenticated_session {
        return Ok(Role::Parent);
    }
    if ctx.child_token {
        return Ok(Role::Child);
    }
    Err(RoleError::Unresolvable)
}

/// The role a machine was brought up under.
///
/// Candidate writes go to role-owned fields as soon as they are generated,
/// so the binding is fixed at construction. A later asynchronous
/// confirmation that disagrees is logged and tolerated; writes already
/// issued under the synchronous resolution are not migrated.
#[derive(Debug, Clone, Copy)]
pub struct RoleBinding {
    role: Role,
}

impl RoleBinding {
    pub fn new(role: Role) -> Self {
        Self { role }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Record an asynchronous confirmation of the local role.
    pub fn note_confirmation(&self, confirmed: Role) {
        if confirmed != self.role {
            warn!(
                target: "Call/Role",
                "role confirmation ({confirmed}) disagrees with resolved role ({}); keeping {}",
                self.role, self.role
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(route: RouteHint, authenticated_session: bool, child_token: bool) -> RoleContext {
        RoleContext {
            route,
            authenticated_session,
            child_token,
        }
    }

    #[test]
    fn test_route_outranks_everything() {
        // A child-only route wins even with a full parent session present.
        let resolved = resolve(&ctx(RouteHint::ChildOnly, true, false)).unwrap();
        assert_eq!(resolved, Role::Child);

        let resolved = resolve(&ctx(RouteHint::ParentOnly, false, true)).unwrap();
        assert_eq!(resolved, Role::Parent);
    }

    #[test]
    fn test_session_outranks_child_token() {
        // Both signals present: the authenticated session decides.
        let resolved = resolve(&ctx(RouteHint::Neutral, true, true)).unwrap();
        assert_eq!(resolved, Role::Parent);
    }

    #[test]
    fn test_child_token_alone_yields_child() {
        let resolved = resolve(&ctx(RouteHint::Neutral, false, true)).unwrap();
        assert_eq!(resolved, Role::Child);
    }

    #[test]
    fn test_no_signal_is_an_error() {
        assert!(resolve(&ctx(RouteHint::Neutral, false, false)).is_err());
    }

    #[test]
    fn test_conflicting_signals_resolve_deterministically() {
        // Same inputs always produce the same role, whatever the conflict.
        let conflicted = ctx(RouteHint::ChildOnly, true, true);
        let first = resolve(&conflicted).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve(&conflicted).unwrap(), first);
        }
    }

    #[test]
    fn test_confirmation_mismatch_keeps_binding() {
        let binding = RoleBinding::new(Role::Child);
        binding.note_confirmation(Role::Parent);
        assert_eq!(binding.role(), Role::Child);
    }
}
