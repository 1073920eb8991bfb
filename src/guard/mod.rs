//! Two-tier route protection: the edge middleware revalidates credentials
//! per request, the page guard re-checks store snapshots at render time,
//! and both classify paths against one data-driven route table.

pub mod middleware;
pub mod page;
pub mod routes;

pub use middleware::{route_guard, CurrentUser, SESSION_COOKIE};
pub use page::{check_page, PageAccess};
pub use routes::{RouteClass, RouteKind, RouteRule, RouteTable};
