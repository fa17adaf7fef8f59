//! JSON API over the download engine.

use std::sync::Arc;

use actix_web::{
    delete,
    dev::ServiceRequest,
    get,
    http::StatusCode,
    patch, post, put,
    web::{Data, Json, Path, Query, ServiceConfig},
    HttpResponse, ResponseError,
};
use actix_web_httpauth::extractors::{
    basic::{self, BasicAuth},
    AuthenticationError,
};
use scrypt::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, Salt},
    Params, Scrypt,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    engine::{Command, DownloadManager},
    error::DownloadError,
    model::NewDownload,
    settings::SettingsPatch,
};

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ResponseError for DownloadError {
    fn status_code(&self) -> StatusCode {
        match self {
            DownloadError::Validation(_) => StatusCode::BAD_REQUEST,
            DownloadError::NotFound(_) => StatusCode::NOT_FOUND,
            DownloadError::InvalidState { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}

type Response = Result<HttpResponse, DownloadError>;

/// Hash the basic auth password once at start-up.
pub fn hash_password(password: &str) -> Option<PasswordHash<'static>> {
    // The parameters are deliberately weak. Nothing is stored, the hash only
    // slows down guessing a little.
    let params = Params::new(1, 8, 1).ok()?;
    let salt = Salt::new("salt").ok()?;
    Scrypt
        .hash_password_customized(password.as_bytes(), None, None, params, salt)
        .ok()
}

pub async fn check_password(
    req: ServiceRequest,
    credentials: BasicAuth,
    hash: Arc<PasswordHash<'static>>,
) -> Result<ServiceRequest, (actix_web::Error, ServiceRequest)> {
    let password = credentials.password().unwrap_or("");
    if Scrypt.verify_password(password.as_bytes(), &hash).is_ok() {
        Ok(req)
    } else {
        warn!("Rejected credentials for user {}", credentials.user_id());
        let config = req
            .app_data::<basic::Config>()
            .cloned()
            .unwrap_or_default()
            .realm("Drogue DM");
        Err((AuthenticationError::from(config).into(), req))
    }
}

#[post("/downloads")]
#[tracing::instrument(level = "info", skip(manager))]
async fn start_download(manager: Data<DownloadManager>, request: Json<NewDownload>) -> Response {
    let id = manager
        .start(&request.url, &request.file_path, &request.file_name)
        .await?;
    Ok(HttpResponse::Created().json(Created { id }))
}

#[derive(Serialize)]
struct Created {
    id: String,
}

#[get("/downloads")]
#[tracing::instrument(level = "debug", skip(manager))]
async fn list_downloads(manager: Data<DownloadManager>) -> Response {
    Ok(HttpResponse::Ok().json(manager.active_downloads().await?))
}

#[get("/downloads/{id}")]
#[tracing::instrument(level = "debug", skip(manager))]
async fn get_download(manager: Data<DownloadManager>, id: Path<String>) -> Response {
    Ok(HttpResponse::Ok().json(manager.download(&id).await?))
}

fn bulk_command(action: &str) -> Result<Command, DownloadError> {
    match action {
        "pause" => Ok(Command::Pause),
        "resume" => Ok(Command::Resume),
        "cancel" => Ok(Command::Cancel),
        "cancel-and-delete" => Ok(Command::CancelAndDelete),
        _ => Err(DownloadError::Validation(format!(
            "unknown action {}",
            action
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct BulkRequest {
    ids: Vec<String>,
}

#[post("/downloads/bulk/{action}")]
#[tracing::instrument(level = "info", skip(manager))]
async fn bulk_download_command(
    manager: Data<DownloadManager>,
    action: Path<String>,
    request: Json<BulkRequest>,
) -> Response {
    let command = bulk_command(&action)?;
    Ok(HttpResponse::Ok().json(manager.bulk(command, &request.ids).await))
}

#[post("/downloads/clear-completed")]
#[tracing::instrument(level = "info", skip(manager))]
async fn clear_completed(manager: Data<DownloadManager>) -> Response {
    let cleared = manager.clear_completed().await?;
    Ok(HttpResponse::Ok().json(Count { count: cleared }))
}

#[derive(Serialize)]
struct Count {
    count: usize,
}

#[derive(Serialize)]
struct Fixed {
    fixed: Vec<String>,
}

#[post("/downloads/check-stalled")]
#[tracing::instrument(level = "info", skip(manager))]
async fn check_stalled(manager: Data<DownloadManager>) -> Response {
    let fixed = manager.check_and_fix_stalled().await?;
    Ok(HttpResponse::Ok().json(Fixed { fixed }))
}

#[post("/downloads/{id}/{action}")]
#[tracing::instrument(level = "info", skip(manager))]
async fn download_command(
    manager: Data<DownloadManager>,
    path: Path<(String, String)>,
) -> Response {
    let (id, action) = path.into_inner();
    match action.as_str() {
        "restart" => manager.restart(&id).await?,
        "reveal" => manager.reveal_in_folder(&id).await?,
        action => manager.command(bulk_command(action)?, &id).await?,
    }
    debug!("Applied {} to {}", action, id);
    Ok(HttpResponse::NoContent().finish())
}

#[get("/stats")]
#[tracing::instrument(level = "debug", skip(manager))]
async fn stats(manager: Data<DownloadManager>) -> Response {
    Ok(HttpResponse::Ok().json(manager.stats().await?))
}

#[get("/settings")]
#[tracing::instrument(level = "debug", skip(manager))]
async fn get_settings(manager: Data<DownloadManager>) -> Response {
    Ok(HttpResponse::Ok().json(manager.settings()))
}

#[patch("/settings")]
#[tracing::instrument(level = "info", skip(manager))]
async fn set_settings(manager: Data<DownloadManager>, patch: Json<SettingsPatch>) -> Response {
    Ok(HttpResponse::Ok().json(manager.set_settings(patch.into_inner()).await?))
}

#[derive(Debug, Serialize, Deserialize)]
struct DirectoryBody {
    path: String,
}

#[get("/download-directory")]
#[tracing::instrument(level = "debug", skip(manager))]
async fn get_download_directory(manager: Data<DownloadManager>) -> Response {
    Ok(HttpResponse::Ok().json(DirectoryBody {
        path: manager.download_directory().display().to_string(),
    }))
}

#[put("/download-directory")]
#[tracing::instrument(level = "info", skip(manager))]
async fn set_download_directory(
    manager: Data<DownloadManager>,
    body: Json<DirectoryBody>,
) -> Response {
    let path = manager.set_download_directory(&body.path).await?;
    Ok(HttpResponse::Ok().json(DirectoryBody {
        path: path.display().to_string(),
    }))
}

#[get("/activities")]
#[tracing::instrument(level = "debug", skip(manager))]
async fn get_activities(manager: Data<DownloadManager>) -> Response {
    Ok(HttpResponse::Ok().json(manager.activities().await))
}

#[derive(Debug, Deserialize)]
struct InteractionBody {
    details: String,
}

#[post("/activities")]
#[tracing::instrument(level = "debug", skip(manager))]
async fn record_interaction(
    manager: Data<DownloadManager>,
    body: Json<InteractionBody>,
) -> Response {
    let entry = manager.record_interaction(body.into_inner().details).await;
    Ok(HttpResponse::Created().json(entry))
}

#[delete("/activities")]
#[tracing::instrument(level = "info", skip(manager))]
async fn clear_activities(manager: Data<DownloadManager>) -> Response {
    let cleared = manager.clear_activities().await?;
    Ok(HttpResponse::Ok().json(Count { count: cleared }))
}

#[derive(Debug, Deserialize)]
struct ExistsQuery {
    path: String,
}

#[derive(Serialize)]
struct Exists {
    exists: bool,
}

#[get("/files/exists")]
#[tracing::instrument(level = "debug", skip(manager))]
async fn file_exists(manager: Data<DownloadManager>, query: Query<ExistsQuery>) -> Response {
    Ok(HttpResponse::Ok().json(Exists {
        exists: manager.check_file_exists(&query.path).await,
    }))
}

/// Register every route. The fixed `/downloads/...` paths go before the
/// `{id}` patterns so they are not taken for ids.
pub fn routes(cfg: &mut ServiceConfig) {
    cfg.service(start_download)
        .service(list_downloads)
        .service(clear_completed)
        .service(check_stalled)
        .service(bulk_download_command)
        .service(get_download)
        .service(download_command)
        .service(stats)
        .service(get_settings)
        .service(set_settings)
        .service(get_download_directory)
        .service(set_download_directory)
        .service(get_activities)
        .service(record_interaction)
        .service(clear_activities)
        .service(file_exists);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies_only_the_password() {
        let hash = hash_password("hunter2").unwrap();
        assert!(Scrypt.verify_password(b"hunter2", &hash).is_ok());
        assert!(Scrypt.verify_password(b"hunter3", &hash).is_err());
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(
            DownloadError::Validation("x".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DownloadError::NotFound("x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DownloadError::InvalidState {
                id: "x".to_string(),
                status: crate::model::DownloadStatus::Completed,
                action: "pause",
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DownloadError::Transport("x".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn unknown_bulk_actions_are_rejected() {
        assert_eq!(bulk_command("pause").unwrap(), Command::Pause);
        assert!(matches!(
            bulk_command("explode"),
            Err(DownloadError::Validation(_))
        ));
    }
}
