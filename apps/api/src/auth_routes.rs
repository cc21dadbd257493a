use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson},
    routing::{get, post},
    Router,
};
use lms_auth::{
    models::{
        ChangePasswordRequest, LoginRequest, RefreshTokenRequest, RegisterRequest,
        UpdateProfileRequest,
    },
    AuthContext, AuthMiddleware, TokenResponse, UserInfo,
};
use lms_error::Result;

use crate::AppState;

/// 创建认证路由；/logout、/me 与 /password 需要有效的访问令牌
pub fn create_auth_routes(state: &AppState) -> Router<AppState> {
    let authenticated = Router::new()
        .route("/logout", post(logout))
        .route("/me", get(get_current_user).patch(update_profile))
        .route("/password", post(change_password))
        .layer(AuthMiddleware::layer(state.guard.clone()));

    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh_token))
        .merge(authenticated)
}

/// 用户注册
async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let identity = state
        .auth
        .register(&request.email, &request.password, request.display_name)
        .await?;
    let info = state.auth.me(identity.id()).await?;
    Ok((StatusCode::CREATED, ResponseJson(info)))
}

/// 用户登录
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    let pair = state.auth.login(&request.email, &request.password).await?;
    Ok((StatusCode::OK, ResponseJson(TokenResponse::from(pair))))
}

/// 轮换刷新令牌
async fn refresh_token(
    State(state): State<AppState>,
    Json(request): Json<RefreshTokenRequest>,
) -> Result<impl IntoResponse> {
    let pair = state.auth.refresh(&request.refresh_token).await?;
    Ok((StatusCode::OK, ResponseJson(TokenResponse::from(pair))))
}

/// 用户登出
async fn logout(State(state): State<AppState>, auth: AuthContext) -> Result<impl IntoResponse> {
    state.auth.logout(auth.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 获取当前用户信息
async fn get_current_user(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<ResponseJson<UserInfo>> {
    Ok(ResponseJson(state.auth.me(auth.user_id).await?))
}

/// 更新当前用户资料
async fn update_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<ResponseJson<UserInfo>> {
    let info = state
        .auth
        .update_profile(auth.user_id, request.email.as_deref(), request.display_name)
        .await?;
    Ok(ResponseJson(info))
}

/// 修改密码，成功后需要重新登录
async fn change_password(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<StatusCode> {
    state
        .auth
        .change_password(auth.user_id, &request.current_password, &request.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
