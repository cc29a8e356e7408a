//! OpenAPI documentation definition.

use utoipa::OpenApi;

use crate::wire::{CaptureConfigDto, StatusDto};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::handle_health,
        crate::handlers::handle_query,
        crate::handlers::handle_status,
        crate::handlers::handle_status_one,
        crate::handlers::handle_config,
        crate::handlers::handle_config_one,
        crate::handlers::handle_config_put,
        crate::handlers::handle_config_reload,
        crate::handlers::handle_flows,
        crate::handlers::handle_flows_one,
    ),
    components(schemas(CaptureConfigDto, StatusDto)),
    info(
        title = "flowprobe-web API",
        version = "1.0",
        description = "Network flow capture/query control surface — live flow status, capture config, and historical queries"
    )
)]
pub(crate) struct ApiDoc;
