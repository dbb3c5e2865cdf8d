use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{auth::AuthenticatedUser, state::AppState};

pub mod accounts;
pub mod auth;
pub mod children;
pub mod dashboard;
pub mod documents;
pub mod employees;
pub mod followups;
pub mod health;
pub mod reports;
pub mod sites;
pub mod sponsorships;
pub mod transactions;

fn cors_layer(state: &AppState) -> CorsLayer {
    let allow_origin = match state.config.cors_allowed_origin.as_ref() {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(err) => {
                        warn!(origin = %value, error = %err, "ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(&state);

    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me));

    let sites_routes = Router::new()
        .route("/", get(sites::list_sites).post(sites::create_site))
        .route("/:id", get(sites::get_site));

    let children_routes = Router::new()
        .route(
            "/",
            get(children::list_children).post(children::create_child),
        )
        .route("/export", get(children::export_preview))
        .route("/export/download", get(children::export_download))
        .route("/history/:history_id", get(children::get_history_entry))
        .route(
            "/:id",
            get(children::get_child).patch(children::update_child),
        )
        .route("/:id/archive", post(children::archive_child))
        .route("/:id/photo", post(children::replace_photo))
        .route("/:id/history", get(children::list_history))
        .route(
            "/:id/documents",
            get(documents::list_child_documents).post(documents::upload_child_document),
        )
        .route(
            "/:id/medical",
            get(followups::list_medical).post(followups::create_medical),
        )
        .route(
            "/:id/school",
            get(followups::list_school).post(followups::create_school),
        );

    let documents_routes = Router::new()
        .route("/:id", delete(documents::delete_document))
        .route("/:id/download", get(documents::download_document));

    let medical_routes = Router::new()
        .route("/:id", patch(followups::update_medical))
        .route("/:id/archive", post(followups::archive_medical));

    let school_routes = Router::new()
        .route("/:id", patch(followups::update_school))
        .route("/:id/archive", post(followups::archive_school));

    let finance_routes = Router::new()
        .route(
            "/accounts",
            get(accounts::list_accounts).post(accounts::create_account),
        )
        .route(
            "/accounts/:id",
            get(accounts::get_account).patch(accounts::update_account),
        )
        .route("/accounts/:id/archive", post(accounts::archive_account))
        .route("/sites/:site_id/accounts", get(accounts::site_accounts))
        .route(
            "/transactions",
            get(transactions::list_transactions).post(transactions::create_transaction),
        )
        .route("/transactions/export", get(transactions::export_preview))
        .route(
            "/transactions/export/download",
            get(transactions::export_download),
        )
        .route(
            "/transactions/:id",
            get(transactions::get_transaction).patch(transactions::update_transaction),
        )
        .route(
            "/transactions/:id/archive",
            post(transactions::archive_transaction),
        )
        .route(
            "/sponsorships",
            get(sponsorships::list_sponsorships).post(sponsorships::create_sponsorship),
        )
        .route(
            "/sponsorships/:id",
            get(sponsorships::get_sponsorship).patch(sponsorships::update_sponsorship),
        )
        .route(
            "/sponsorships/:id/archive",
            post(sponsorships::archive_sponsorship),
        )
        .route("/report", get(reports::financial_report));

    let personnel_routes = Router::new()
        .route(
            "/",
            get(employees::list_employees).post(employees::create_employee),
        )
        .route(
            "/:id",
            get(employees::get_employee).patch(employees::update_employee),
        )
        .route("/:id/archive", post(employees::archive_employee));

    let protected_state = state.clone();
    let protected_routes = Router::new()
        .nest("/api/sites", sites_routes)
        .nest("/api/children", children_routes)
        .nest("/api/documents", documents_routes)
        .nest("/api/medical", medical_routes)
        .nest("/api/school", school_routes)
        .nest("/api/finances", finance_routes)
        .nest("/api/personnel", personnel_routes)
        .route("/api/dashboard", get(dashboard::dashboard))
        .layer(middleware::from_extractor_with_state::<AuthenticatedUser, _>(protected_state));

    let body_limit = state.config.upload_max_bytes;

    Router::new()
        .merge(protected_routes)
        .nest("/api/auth", auth_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}
