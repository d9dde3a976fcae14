use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wenku_rss::app_state::AppState;
use wenku_rss::browser::BrowserSession;
use wenku_rss::config::Config;
use wenku_rss::db::{NovelStore, SqliteStore};
use wenku_rss::error::SyncError;
use wenku_rss::helpers::now_ts;
use wenku_rss::queue::WorkQueue;
use wenku_rss::scheduler::run_scheduler;
use wenku_rss::source::{NovelSource, WenkuSource};
use wenku_rss::sync::{SyncEngine, SyncOptions};
use wenku_rss::{feeds, models};

fn init_logging() {
    if log4rs::init_file("log4rs.yml", Default::default()).is_err() {
        let stdout = ConsoleAppender::builder().build();
        let config = log4rs::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info))
            .expect("console logging config");
        let _ = log4rs::init_config(config);
    }
}

fn error_response(err: &SyncError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });
    match err.status() {
        404 => HttpResponse::NotFound().json(body),
        502 => HttpResponse::BadGateway().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[get("/stats")]
async fn stats(state: web::Data<AppState>) -> impl Responder {
    match state.store.stats() {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => error_response(&SyncError::persistence("reading stats", e)),
    }
}

#[get("/novels")]
async fn list_novels(state: web::Data<AppState>) -> impl Responder {
    match state.store.list_novels() {
        Ok(novels) => HttpResponse::Ok().json(novels),
        Err(e) => error_response(&SyncError::persistence("listing novels", e)),
    }
}

#[derive(serde::Serialize)]
struct NovelView {
    #[serde(flatten)]
    novel: models::NovelRecord,
    volumes: Vec<models::VolumeRecord>,
}

/// Serve the persisted novel. A stale stored row is served as-is with a
/// background re-sync queued; a novel never seen before is synced inline.
#[get("/novel/{nid}")]
async fn get_novel(state: web::Data<AppState>, path: web::Path<u32>) -> impl Responder {
    let nid = path.into_inner();
    let stored = match state.store.get_novel(nid) {
        Ok(stored) => stored,
        Err(e) => return error_response(&SyncError::persistence("reading novel", e)),
    };

    let novel = match stored {
        Some(novel) => {
            let window = if novel.done {
                state.config.sync.fresh_done_secs
            } else {
                state.config.sync.fresh_pending_secs
            };
            if now_ts() - novel.fetched_at >= window {
                state.engine.schedule_update(nid);
            }
            novel
        }
        None => match state.engine.update_novel(nid, false).await {
            Ok(novel) => novel,
            Err(e) => return error_response(&e),
        },
    };

    match state.store.volumes_for_novel(nid) {
        Ok(volumes) => HttpResponse::Ok().json(NovelView { novel, volumes }),
        Err(e) => error_response(&SyncError::persistence("reading volumes", e)),
    }
}

#[post("/novel/{nid}/sync")]
async fn trigger_sync(state: web::Data<AppState>, path: web::Path<u32>) -> impl Responder {
    let nid = path.into_inner();
    let scheduled = state.engine.schedule_update(nid);
    HttpResponse::Accepted().json(serde_json::json!({ "nid": nid, "scheduled": scheduled }))
}

#[get("/sync/status")]
async fn sync_status(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.engine.progress())
}

#[get("/novel/{nid}/chapter/{cid}")]
async fn get_chapter(state: web::Data<AppState>, path: web::Path<(u32, u32)>) -> impl Responder {
    let (nid, cid) = path.into_inner();
    match state.store.get_chapter(cid) {
        Ok(Some(chapter)) if chapter.nid == nid => HttpResponse::Ok().json(chapter),
        Ok(_) => error_response(&SyncError::NotFound(format!("chapter {}:{}", nid, cid))),
        Err(e) => error_response(&SyncError::persistence("reading chapter", e)),
    }
}

#[get("/novel/{nid}/rss")]
async fn novel_rss(state: web::Data<AppState>, path: web::Path<u32>) -> impl Responder {
    let nid = path.into_inner();
    let novel = match state.store.get_novel(nid) {
        Ok(Some(novel)) => novel,
        Ok(None) => match state.engine.update_novel(nid, false).await {
            Ok(novel) => novel,
            Err(e) => return error_response(&e),
        },
        Err(e) => return error_response(&SyncError::persistence("reading novel", e)),
    };
    match state.store.chapters_for_novel(nid) {
        Ok(chapters) => HttpResponse::Ok()
            .content_type("application/rss+xml; charset=utf-8")
            .body(feeds::novel_rss(&novel, &chapters, &state.config.public_url)),
        Err(e) => error_response(&SyncError::persistence("reading chapters", e)),
    }
}

#[get("/opml")]
async fn opml(state: web::Data<AppState>) -> impl Responder {
    match state.store.list_novels() {
        Ok(novels) => HttpResponse::Ok()
            .content_type("text/x-opml; charset=utf-8")
            .body(feeds::opml(&novels, &state.config.public_url)),
        Err(e) => error_response(&SyncError::persistence("listing novels", e)),
    }
}

#[get("/browse")]
async fn browse(
    state: web::Data<AppState>,
    query: web::Query<Vec<(String, String)>>,
) -> impl Responder {
    match state.source.browse(&query.into_inner()).await {
        Ok(list) => HttpResponse::Ok().json(list),
        Err(e) => error_response(&e),
    }
}

#[get("/top")]
async fn top(
    state: web::Data<AppState>,
    query: web::Query<Vec<(String, String)>>,
) -> impl Responder {
    match state.source.top(&query.into_inner()).await {
        Ok(list) => HttpResponse::Ok().json(list),
        Err(e) => error_response(&e),
    }
}

/// Proxy upstream images so clients never hit the origin directly.
#[get("/img/{url:.*}")]
async fn image_proxy(state: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let url = match urlencoding::decode(&path.into_inner()) {
        Ok(url) => url.into_owned(),
        Err(_) => return HttpResponse::BadRequest().body("bad image url"),
    };
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return HttpResponse::BadRequest().body("bad image url");
    }
    match state.http.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            match resp.bytes().await {
                Ok(bytes) => HttpResponse::Ok().content_type(content_type).body(bytes),
                Err(e) => {
                    log::warn!("image proxy read failed for {}: {}", url, e);
                    HttpResponse::BadGateway().finish()
                }
            }
        }
        Ok(resp) => {
            let status = actix_web::http::StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
            HttpResponse::build(status).finish()
        }
        Err(e) => {
            log::warn!("image proxy fetch failed for {}: {}", url, e);
            HttpResponse::BadGateway().finish()
        }
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_logging();
    let config = Config::load();
    log::info!("starting on {}:{}", config.host, config.port);

    let store: Arc<dyn NovelStore> = Arc::new(
        SqliteStore::open(&config.db_path).map_err(std::io::Error::other)?,
    );
    let session = Arc::new(BrowserSession::new(
        config.browser.clone(),
        config.base_url.clone(),
    ));
    let queue = Arc::new(WorkQueue::new(
        config.sync.listing_limit,
        config.sync.detail_limit,
    ));
    let source: Arc<dyn NovelSource> = Arc::new(WenkuSource::new(
        Arc::clone(&session),
        queue,
        &config.cache,
        config.browser.request_delay_ms,
    ));
    let cancel = CancellationToken::new();
    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&source),
        Arc::clone(&store),
        SyncOptions::from(&config.sync),
        cancel.child_token(),
    ));

    actix_web::rt::spawn(run_scheduler(
        Arc::clone(&engine),
        Arc::clone(&store),
        SyncOptions::from(&config.sync),
        Duration::from_secs(config.sync.scheduler_interval_secs),
        cancel.child_token(),
    ));

    let state = web::Data::new(AppState {
        config: config.clone(),
        store,
        source,
        engine,
        http: reqwest::Client::new(),
        cancel: cancel.clone(),
    });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(health)
            .service(stats)
            .service(list_novels)
            .service(sync_status)
            .service(opml)
            .service(browse)
            .service(top)
            .service(trigger_sync)
            .service(novel_rss)
            .service(get_chapter)
            .service(get_novel)
            .service(image_proxy)
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await;

    cancel.cancel();
    session.close().await;
    server
}
