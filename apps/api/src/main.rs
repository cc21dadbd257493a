use axum::{routing::get, Json, Router};

mod admin_routes;
mod auth_routes;

use dotenv::dotenv;
use lms_auth::{
    AdminService, AuthConfig, AuthService, AuthorizationGuard, IdentityRepository,
    InMemoryDirectory, InMemoryRefreshTokenStore, RbacService, RefreshTokenStore,
    RolePermissionRepository, TokenService,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// 路由共享状态
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthService,
    pub admin: AdminService,
    pub guard: AuthorizationGuard,
}

#[derive(Debug, Deserialize)]
struct AppConfig {
    server: ServerCfg,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    database: DatabaseCfg,
}

#[derive(Debug, Deserialize)]
struct ServerCfg {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct DatabaseCfg {
    max_connections: u32,
}

impl Default for DatabaseCfg {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

struct Repositories {
    identities: Arc<dyn IdentityRepository>,
    roles: Arc<dyn RolePermissionRepository>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
}

impl Repositories {
    fn in_memory() -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        Self {
            identities: directory.clone(),
            roles: directory,
            refresh_tokens: Arc::new(InMemoryRefreshTokenStore::new()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let cfg: AppConfig = load_config()?;
    let mut auth_cfg = cfg.auth.clone();
    auth_cfg.apply_env()?;

    let repositories = open_repositories(&cfg.database).await?;
    let state = build_state(auth_cfg, repositories)?;
    bootstrap(&state).await?;

    let app = build_router(state)?;
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    info!(%addr, "lms-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(auth_cfg: AuthConfig, repositories: Repositories) -> anyhow::Result<AppState> {
    let Repositories {
        identities,
        roles,
        refresh_tokens,
    } = repositories;

    let tokens = Arc::new(TokenService::new(auth_cfg)?);
    let rbac = Arc::new(RbacService::new(roles.clone()));
    let guard = AuthorizationGuard::new(tokens.clone(), rbac.clone(), identities.clone());
    let auth = AuthService::new(
        identities.clone(),
        roles.clone(),
        tokens,
        refresh_tokens.clone(),
        rbac.clone(),
    );
    let admin = AdminService::new(identities, roles, refresh_tokens, rbac);

    Ok(AppState { auth, admin, guard })
}

/// 补齐内置角色；设置了 ADMIN_EMAIL/ADMIN_PASSWORD 时确保管理员账户存在
async fn bootstrap(state: &AppState) -> anyhow::Result<()> {
    state.admin.seed_system_roles().await?;

    match (std::env::var("ADMIN_EMAIL"), std::env::var("ADMIN_PASSWORD")) {
        (Ok(email), Ok(password)) => {
            let admin = state.admin.ensure_admin_account(&email, &password).await?;
            info!(user_id = %admin.id(), "bootstrap admin ready");
        }
        _ => info!("ADMIN_EMAIL/ADMIN_PASSWORD not set; skipping admin bootstrap"),
    }
    Ok(())
}

fn build_router(state: AppState) -> anyhow::Result<Router> {
    let api = Router::new()
        .route("/health", get(health))
        .nest("/auth", auth_routes::create_auth_routes(&state))
        .nest("/admin", admin_routes::create_admin_routes(&state))
        .merge(admin_routes::create_user_routes(&state)?);

    Ok(Router::new()
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(feature = "pg")]
async fn open_repositories(db: &DatabaseCfg) -> anyhow::Result<Repositories> {
    use lms_auth::pg::{
        connect, PgIdentityRepository, PgRefreshTokenStore, PgRolePermissionRepository,
    };

    let Ok(url) = std::env::var("DATABASE_URL") else {
        info!("DATABASE_URL not set; using in-memory repositories");
        return Ok(Repositories::in_memory());
    };

    let pool = connect(&url, db.max_connections).await?;
    info!("postgres repositories ready");
    Ok(Repositories {
        identities: Arc::new(PgIdentityRepository::new(pool.clone())),
        roles: Arc::new(PgRolePermissionRepository::new(pool.clone())),
        refresh_tokens: Arc::new(PgRefreshTokenStore::new(pool)),
    })
}

#[cfg(not(feature = "pg"))]
async fn open_repositories(_db: &DatabaseCfg) -> anyhow::Result<Repositories> {
    info!("built without pg feature; using in-memory repositories");
    Ok(Repositories::in_memory())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config() -> anyhow::Result<AppConfig> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "configs/default.yaml".to_string());
    let s = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path, e))?;
    let cfg: AppConfig = serde_yaml::from_str(&s)?;
    info!(path = %path, server = ?cfg.server, auth = ?cfg.auth.issuer, "load_config");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
        response::Response,
    };
    use tower::ServiceExt;

    const PASSWORD: &str = "Sunflower#2024";

    async fn test_app() -> (AppState, Router) {
        let state = build_state(
            AuthConfig::new("api-test-secret-0123456789abcdef"),
            Repositories::in_memory(),
        )
        .unwrap();
        state.admin.seed_system_roles().await.unwrap();
        state
            .admin
            .ensure_admin_account("admin@example.com", PASSWORD)
            .await
            .unwrap();
        let router = build_router(state.clone()).unwrap();
        (state, router)
    }

    fn json_request(
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn login(app: &Router, email: &str) -> String {
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/auth/login",
                None,
                json!({ "email": email, "password": PASSWORD }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await["access_token"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn register(app: &Router, email: &str) -> String {
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/auth/register",
                None,
                json!({ "email": email, "password": PASSWORD, "display_name": null }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_register_login_me() {
        let (_, app) = test_app().await;
        register(&app, "learner@example.com").await;
        let token = login(&app, "learner@example.com").await;

        let response = app
            .clone()
            .oneshot(json_request(Method::GET, "/api/v1/auth/me", Some(&token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["email"], "learner@example.com");
        assert_eq!(body["roles"], json!(["student"]));
    }

    #[tokio::test]
    async fn test_student_cannot_reach_admin_routes() {
        let (_, app) = test_app().await;
        register(&app, "learner@example.com").await;
        let token = login(&app, "learner@example.com").await;

        let response = app
            .oneshot(json_request(Method::GET, "/api/v1/admin/roles", Some(&token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "insufficient_permissions");
    }

    #[tokio::test]
    async fn test_admin_cannot_deactivate_self() {
        let (state, app) = test_app().await;
        let token = login(&app, "admin@example.com").await;
        let admin_id = state.guard.authenticate(Some(&token)).await.unwrap();
        let admin_id = admin_id.into_result().unwrap().user_id;

        let response = app
            .oneshot(json_request(
                Method::POST,
                &format!("/api/v1/admin/users/{}/deactivate", admin_id),
                Some(&token),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"], "self_action_forbidden");
    }

    #[tokio::test]
    async fn test_deactivated_user_token_is_rejected() {
        let (_, app) = test_app().await;
        let user_id = register(&app, "learner@example.com").await;
        let user_token = login(&app, "learner@example.com").await;
        let admin_token = login(&app, "admin@example.com").await;

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                &format!("/api/v1/admin/users/{}/deactivate", user_id),
                Some(&admin_token),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["is_active"], false);
        assert_eq!(
            body["permissions"],
            json!(["courses:read", "enrollments:create", "enrollments:read", "lessons:read"])
        );

        let response = app
            .oneshot(json_request(Method::GET, "/api/v1/auth/me", Some(&user_token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "invalid_session");
    }

    #[tokio::test]
    async fn test_granted_permission_applies_without_relogin() {
        let (_, app) = test_app().await;
        let viewer_id = register(&app, "viewer@example.com").await;
        let target_id = register(&app, "target@example.com").await;
        let viewer_token = login(&app, "viewer@example.com").await;
        let admin_token = login(&app, "admin@example.com").await;
        let uri = format!("/api/v1/users/{}", target_id);

        let response = app
            .clone()
            .oneshot(json_request(Method::GET, &uri, Some(&viewer_token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                &format!("/api/v1/admin/users/{}/permissions", viewer_id),
                Some(&admin_token),
                json!({ "permissions": ["users:read"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(json_request(Method::GET, &uri, Some(&viewer_token), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["email"], "target@example.com");
    }

    #[tokio::test]
    async fn test_system_role_grants_are_protected() {
        let (_, app) = test_app().await;
        let token = login(&app, "admin@example.com").await;

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/api/v1/admin/roles/admin/permissions",
                Some(&token),
                json!({ "permission": "courses:read" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "system_role_protected");
    }

    #[tokio::test]
    async fn test_admin_password_reset_and_self_service_change() {
        let (_, app) = test_app().await;
        let user_id = register(&app, "learner@example.com").await;
        let admin_token = login(&app, "admin@example.com").await;

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                &format!("/api/v1/admin/users/{}/reset-password", user_id),
                Some(&admin_token),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let temporary = body_json(response).await["temporary_password"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/auth/login",
                None,
                json!({ "email": "learner@example.com", "password": temporary }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token = body_json(response).await["access_token"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/v1/auth/password",
                Some(&token),
                json!({ "current_password": temporary, "new_password": PASSWORD }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        login(&app, "learner@example.com").await;

        let response = app
            .oneshot(json_request(
                Method::PATCH,
                "/api/v1/auth/me",
                Some(&token),
                json!({ "display_name": "Learner" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["display_name"], "Learner");
    }

    #[test]
    fn test_config_parses_without_secret() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 8080
auth:
  issuer: lms-auth
  audience: lms-api
  access_ttl_minutes: 15
  refresh_ttl_days: 7
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.auth.secret.is_empty());
        assert_eq!(cfg.database.max_connections, 5);
    }
}
