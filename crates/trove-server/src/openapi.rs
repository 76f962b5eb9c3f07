use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Trove API",
        version = "0.1.0",
        description = "Start, poll and cancel product scrape jobs, and browse stored products."
    ),
    paths(
        crate::routes::create_job,
        crate::routes::list_jobs,
        crate::routes::get_job,
        crate::routes::cancel_job,
        crate::routes::list_products,
        crate::routes::delete_products,
        crate::routes::system_status,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::FiltersBody,
        crate::dto::CreateJobRequest,
        crate::dto::CreateJobResponse,
        crate::dto::JobSummaryResponse,
        crate::dto::JobStatusResponse,
        crate::dto::JobListResponse,
        crate::dto::CancelJobResponse,
        crate::dto::ProductResponse,
        crate::dto::ProductListResponse,
        crate::dto::DeleteProductsRequest,
        crate::dto::DeleteProductsResponse,
        crate::dto::JobCountsResponse,
        crate::dto::IdentityResponse,
        crate::dto::SourceRateResponse,
        crate::dto::SystemStatusResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "jobs", description = "Scrape job lifecycle"),
        (name = "products", description = "Stored product records"),
        (name = "system", description = "Health and engine status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Registers the bearer-token security scheme.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some("API key, set via TROVE_SERVER_API_KEY."))
                        .build(),
                ),
            );
        }
    }
}
