//! Network-facing components: transport, per-account pacing, endpoint pagination.

pub mod account_client;
pub mod endpoint;
pub mod http_client;
pub mod query;
pub mod rate_limiter;

pub use account_client::{check_payload, AccountClient, AuditLog, RISK_CONTROL_SENTINEL};
pub use endpoint::{
    parse_card_group_users, parse_number_from_text, render_resource, EndpointFetcher,
    EndpointItems, UserCard, DEFAULT_API_BASE,
};
pub use http_client::{HttpTransport, JsonResponse, Transport};
pub use query::{expand_query_variants, normalize_templates, DEFAULT_QUERY_TEMPLATES};
pub use rate_limiter::{PacerStats, RequestPacer};
