//! scrobble-bridge 0.2.x: Last.fm "now playing" → Discord Rich Presence
//! - Polls user.getrecenttracks for one user and mirrors the live track into presence.
//! - Discord only renders activity art from public URLs, so covers are re-hosted via
//!   catbox.moe and remembered on disk, keyed by a hash of the source URL.
//! - Lightweight IPC over Unix socket for control (status/start/stop/config).
//!
//! Notes:
//! - Ticks overlap: a slow fetch or upload never delays the next poll, and a tick
//!   that fails only logs — the scheduler keeps running.
//! - No unsafe. Avoid holding locks across awaits; the per-key relay lock is a
//!   tokio Mutex held exactly for one miss.
//! - Settings changes restart the whole session (stop, then start with the new snapshot).

#![deny(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery, clippy::perf)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::too_many_lines
)]

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use discord_sdk::{
    activity::{ActivityBuilder, Assets},
    wheel::{UserState, Wheel},
    Discord as DiscordClient, Subscriptions,
};
use regex::Regex;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha1::{Digest, Sha1};
use std::{
    collections::HashMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    signal::unix::{signal, SignalKind},
    sync::{mpsc, oneshot, Mutex},
    task,
    time::interval,
};

const LASTFM_API: &str = "https://ws.audioscrobbler.com/2.0/";
const UPLOAD_API: &str = "https://catbox.moe/user/api.php";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ------------------------- Config -------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct Config {
    #[serde(default)]
    lastfm: Lastfm,
    #[serde(default)]
    discord: Discord,
    #[serde(default)]
    cache: Cache,
    #[serde(default)]
    poll: Poll,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct Lastfm {
    #[serde(default)]
    user: String,
    #[serde(default)]
    api_key: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct Discord {
    #[serde(default)]
    client_id: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct Cache {
    #[serde(default)]
    dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct Poll {
    #[serde(default = "d15")]
    interval_secs: u64,
}
fn d15() -> u64 {
    15
}
impl Default for Poll {
    fn default() -> Self {
        Self {
            interval_secs: d15(),
        }
    }
}

impl Config {
    // The pipeline only runs with a complete identity: username, API key, app id.
    fn is_valid(&self) -> bool {
        !self.lastfm.user.is_empty()
            && !self.lastfm.api_key.is_empty()
            && !self.discord.client_id.is_empty()
    }
}

// ------------------------- Model/State -------------------------

#[derive(Debug)]
struct NowPlaying {
    title: String,
    artist: String,
    album: String,
    image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}
impl ConnState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

#[derive(Debug)]
enum PresenceCmd {
    Publish(NowPlaying, String),
    Clear,
    Shutdown,
}

#[derive(Debug)]
struct Ctx {
    config_path: PathBuf,
    cache_dir: PathBuf,
    http: reqwest::Client,

    // Current snapshot; replaced wholesale on settings change, never mutated in place.
    cfg: RwLock<Config>,

    // Mirrors the presence task's connection state for the status command.
    conn: RwLock<ConnState>,

    // One lock per cache key so concurrent misses collapse into one upload.
    relay_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Ctx {
    fn new(cfg: Config, config_path: PathBuf) -> Self {
        let cache_dir = PathBuf::from(expand(
            cfg.cache
                .dir
                .as_deref()
                .unwrap_or("$XDG_CACHE_HOME/scrobble-bridge/covers"),
        ));
        Self {
            config_path,
            cache_dir,
            http: reqwest::Client::new(),
            cfg: RwLock::new(cfg),
            conn: RwLock::new(ConnState::Disconnected),
            relay_locks: Mutex::new(HashMap::new()),
        }
    }
}

// A running pipeline: the recurring poll and the presence connection live and
// die together. Created by start_session, consumed by stop_session.
struct Session {
    cmd_tx: mpsc::UnboundedSender<PresenceCmd>,
    ticker: task::JoinHandle<()>,
    presence: task::JoinHandle<()>,
}

// ------------------------- Utils -------------------------

fn expand(path: &str) -> String {
    let mut s = path.to_string();
    if let Some(home) = dirs::home_dir() {
        s = s.replace("$HOME", home.to_string_lossy().as_ref());
    }
    if let Some(cfg) = dirs::config_dir() {
        s = s.replace("$XDG_CONFIG_HOME", cfg.to_string_lossy().as_ref());
    }
    if let Some(cache) = dirs::cache_dir() {
        s = s.replace("$XDG_CACHE_HOME", cache.to_string_lossy().as_ref());
    }
    if let Ok(run) = std::env::var("XDG_RUNTIME_DIR") {
        s = s.replace("$XDG_RUNTIME_DIR", &run);
    } else {
        let uid = nix::unistd::Uid::current().as_raw();
        s = s.replace("$XDG_RUNTIME_DIR", &format!("/run/user/{uid}"));
    }
    s
}

fn runtime_dir() -> String {
    std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| {
        let uid = nix::unistd::Uid::current().as_raw();
        format!("/run/user/{uid}")
    })
}

fn ensure_dirs(ctx: &Ctx) {
    if let Some(p) = ctx.config_path.parent() {
        let _ = fs::create_dir_all(p);
    }
    let _ = fs::create_dir_all(&ctx.cache_dir);
}

fn is_http_url(s: &str) -> bool {
    Regex::new(r"^https?://").unwrap().is_match(s)
}

fn set_conn(ctx: &Ctx, st: ConnState) {
    *ctx.conn.write().unwrap() = st;
}

// ------------------------- Now Playing (Last.fm) -------------------------

// user.getrecenttracks with limit=1; every nested field is optional because the
// API degrades badly (error bodies, empty "#text" fields, absent "@attr").
#[derive(Debug, Deserialize)]
struct RecentTracksResponse {
    recenttracks: Option<RecentTracks>,
}

#[derive(Debug, Deserialize)]
struct RecentTracks {
    #[serde(default)]
    track: Vec<RecentTrack>,
}

#[derive(Debug, Deserialize)]
struct RecentTrack {
    name: Option<String>,
    artist: Option<TextField>,
    album: Option<TextField>,
    #[serde(default)]
    image: Vec<ImageVariant>,
    #[serde(rename = "@attr")]
    attr: Option<TrackAttr>,
}

#[derive(Debug, Deserialize)]
struct TextField {
    #[serde(rename = "#text")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageVariant {
    size: Option<String>,
    #[serde(rename = "#text")]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrackAttr {
    nowplaying: Option<String>,
}

async fn fetch_now_playing(ctx: &Ctx, cfg: &Config) -> Result<Option<NowPlaying>> {
    let url = format!(
        "{LASTFM_API}?method=user.getrecenttracks&user={}&api_key={}&format=json&limit=1",
        urlencoding::encode(&cfg.lastfm.user),
        cfg.lastfm.api_key
    );
    let resp = ctx.http.get(&url).send().await.context("last.fm request")?;
    let text = resp.text().await.context("last.fm response body")?;
    let parsed: RecentTracksResponse = serde_json::from_str(&text).context("last.fm json")?;
    Ok(interpret_recent(parsed))
}

// A track counts as live only with a non-empty nowplaying marker; anything else
// (history entry, empty track list, error body) reads as "not playing".
fn interpret_recent(resp: RecentTracksResponse) -> Option<NowPlaying> {
    let track = resp.recenttracks?.track.into_iter().next()?;
    let live = track
        .attr
        .as_ref()
        .and_then(|a| a.nowplaying.as_deref())
        .is_some_and(|s| !s.is_empty());
    if !live {
        return None;
    }
    let image_url = track
        .image
        .iter()
        .find(|i| i.size.as_deref() == Some("extralarge"))
        .and_then(|i| i.url.clone())
        .filter(|u| is_http_url(u));
    Some(NowPlaying {
        title: track.name.unwrap_or_default(),
        artist: track.artist.and_then(|a| a.text).unwrap_or_default(),
        album: track.album.and_then(|a| a.text).unwrap_or_default(),
        image_url,
    })
}

// ------------------------- Cover Relay (catbox) -------------------------

fn art_cache_key(url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}

// Source URL → hosted URL, permanent. The key hashes the URL string, not the
// bytes: two URLs serving the same image stay distinct entries.
async fn resolve_cover(ctx: &Ctx, image_url: &str) -> Result<String> {
    let key = art_cache_key(image_url);
    let entry = ctx.cache_dir.join(format!("{key}.txt"));

    let lock = {
        let mut locks = ctx.relay_locks.lock().await;
        locks.entry(key).or_default().clone()
    };
    let _flight = lock.lock().await;

    if entry.is_file() {
        let hosted = fs::read_to_string(&entry).context("reading cover cache entry")?;
        return Ok(hosted.trim().to_string());
    }

    let resp = ctx
        .http
        .get(image_url)
        .send()
        .await
        .context("downloading cover art")?;
    if !resp.status().is_success() {
        bail!("cover download failed: {}", resp.status());
    }
    let bytes = resp.bytes().await.unwrap_or_else(|_| Bytes::new());
    if bytes.is_empty() {
        bail!("cover download returned no data");
    }

    let part = multipart::Part::bytes(bytes.to_vec()).file_name("cover.jpg");
    let form = multipart::Form::new()
        .text("reqtype", "fileupload")
        .part("fileToUpload", part);
    let resp = ctx
        .http
        .post(UPLOAD_API)
        .multipart(form)
        .send()
        .await
        .context("uploading cover art")?;
    if !resp.status().is_success() {
        bail!("cover upload failed: {}", resp.status());
    }
    let hosted = resp
        .text()
        .await
        .context("cover upload response")?
        .trim()
        .to_string();
    if hosted.is_empty() {
        bail!("cover upload returned an empty body");
    }

    let _ = fs::create_dir_all(&ctx.cache_dir);
    fs::write(&entry, &hosted).context("writing cover cache entry")?;
    Ok(hosted)
}

// ------------------------- Presence (Discord) -------------------------

// Owns the Discord connection for one session. Readiness is signalled once the
// handshake lands; after Shutdown (or the channel closing) the activity is
// cleared and the connection released, so late publishes from in-flight ticks
// just land on a closed channel.
async fn presence_task(
    ctx: Arc<Ctx>,
    client_id: i64,
    mut rx: mpsc::UnboundedReceiver<PresenceCmd>,
    ready_tx: oneshot::Sender<()>,
) {
    set_conn(&ctx, ConnState::Connecting);

    let (wheel, handler) = Wheel::new(Box::new(|err| {
        eprintln!("scrobble-bridge: discord error: {err:?}");
    }));
    let mut user_spoke = wheel.user();

    let discord = match DiscordClient::new(client_id, Subscriptions::ACTIVITY, Box::new(handler)) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("scrobble-bridge: discord unavailable: {e:?}");
            set_conn(&ctx, ConnState::Disconnected);
            return;
        }
    };

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        if user_spoke.0.changed().await.is_err() {
            Err("discord connection closed".to_string())
        } else {
            match &*user_spoke.0.borrow() {
                UserState::Connected(user) => Ok(user.username.clone()),
                UserState::Disconnected(err) => Err(format!("discord login failed: {err:?}")),
            }
        }
    })
    .await;

    let username = match handshake {
        Ok(Ok(user)) => user,
        Ok(Err(e)) => {
            eprintln!("scrobble-bridge: {e}");
            discord.disconnect().await;
            set_conn(&ctx, ConnState::Disconnected);
            return;
        }
        Err(_) => {
            eprintln!("scrobble-bridge: discord handshake timed out");
            discord.disconnect().await;
            set_conn(&ctx, ConnState::Disconnected);
            return;
        }
    };
    eprintln!("scrobble-bridge: presence connected as {username}");
    set_conn(&ctx, ConnState::Connected);

    // Session torn down while we were logging in.
    if ready_tx.send(()).is_err() {
        discord.disconnect().await;
        set_conn(&ctx, ConnState::Disconnected);
        return;
    }

    while let Some(cmd) = rx.recv().await {
        match cmd {
            PresenceCmd::Publish(track, art_url) => {
                let album = Some(track.album.as_str()).filter(|s| !s.is_empty());
                let activity = ActivityBuilder::new()
                    .details(track.title.clone())
                    .state(format!("by {}", track.artist))
                    .assets(Assets::default().large(art_url.clone(), album));
                if let Err(e) = discord.update_activity(activity).await {
                    eprintln!("scrobble-bridge: presence update failed: {e:?}");
                }
            }
            PresenceCmd::Clear => {
                if let Err(e) = discord.clear_activity().await {
                    eprintln!("scrobble-bridge: presence clear failed: {e:?}");
                }
            }
            PresenceCmd::Shutdown => break,
        }
    }

    let _ = discord.clear_activity().await;
    discord.disconnect().await;
    set_conn(&ctx, ConnState::Disconnected);
    eprintln!("scrobble-bridge: presence disconnected");
}

// ------------------------- Session / Scheduler -------------------------

// Ticks only start once the presence handshake lands; a failed login leaves
// the session idle until the next explicit restart.
async fn scheduler_loop(
    ctx: Arc<Ctx>,
    cfg: Config,
    tx: mpsc::UnboundedSender<PresenceCmd>,
    ready_rx: oneshot::Receiver<()>,
) {
    if ready_rx.await.is_err() {
        return;
    }
    let mut tick = interval(Duration::from_secs(cfg.poll.interval_secs.max(1)));
    loop {
        tick.tick().await;
        let ctx2 = ctx.clone();
        let cfg2 = cfg.clone();
        let tx2 = tx.clone();
        // Each tick is its own task: overlapping ticks are allowed, and one
        // tick's failure never cancels the next.
        task::spawn(async move {
            if let Err(e) = run_tick(&ctx2, &cfg2, &tx2).await {
                eprintln!("scrobble-bridge: update failed: {e:#}");
            }
        });
    }
}

async fn run_tick(ctx: &Ctx, cfg: &Config, tx: &mpsc::UnboundedSender<PresenceCmd>) -> Result<()> {
    if !cfg.is_valid() {
        return Ok(());
    }
    let now = fetch_now_playing(ctx, cfg).await?;
    apply_update(ctx, tx, now).await
}

async fn apply_update(
    ctx: &Ctx,
    tx: &mpsc::UnboundedSender<PresenceCmd>,
    now: Option<NowPlaying>,
) -> Result<()> {
    let Some(track) = now else {
        let _ = tx.send(PresenceCmd::Clear);
        return Ok(());
    };
    let Some(image_url) = track.image_url.as_deref() else {
        let _ = tx.send(PresenceCmd::Clear);
        return Ok(());
    };
    let hosted = resolve_cover(ctx, image_url).await?;
    let _ = tx.send(PresenceCmd::Publish(track, hosted));
    Ok(())
}

fn start_session(ctx: &Arc<Ctx>) -> Option<Session> {
    let cfg = ctx.cfg.read().unwrap().clone();
    if !cfg.is_valid() {
        return None;
    }
    let client_id = match cfg.discord.client_id.trim().parse::<i64>() {
        Ok(id) => id,
        Err(_) => {
            eprintln!("scrobble-bridge: discord client id is not numeric");
            return None;
        }
    };
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let presence = task::spawn(presence_task(ctx.clone(), client_id, cmd_rx, ready_tx));
    let ticker = task::spawn(scheduler_loop(ctx.clone(), cfg, cmd_tx.clone(), ready_rx));
    Some(Session {
        cmd_tx,
        ticker,
        presence,
    })
}

// Aborting the ticker only stops future ticks; in-flight tick tasks finish on
// their own and their publish lands on a closed channel.
async fn stop_session(session: Session) {
    session.ticker.abort();
    let _ = session.cmd_tx.send(PresenceCmd::Shutdown);
    let _ = session.presence.await;
}

// Explicit stop-then-start with the new snapshot.
async fn apply_config(ctx: &Arc<Ctx>, session: Option<Session>, new_cfg: Config) -> Option<Session> {
    if let Some(s) = session {
        stop_session(s).await;
    }
    *ctx.cfg.write().unwrap() = new_cfg;
    start_session(ctx)
}

// ------------------------- IPC (Unix socket) -------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd")]
enum CtlCmd {
    #[serde(rename = "start")]
    Start,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "get-config")]
    GetConfig,
    #[serde(rename = "set-config")]
    SetConfig {
        user: Option<String>,
        api_key: Option<String>,
        client_id: Option<String>,
    },
}

struct CtlRequest {
    cmd: CtlCmd,
    reply: oneshot::Sender<serde_json::Value>,
}

fn merged(
    cur: &Config,
    user: Option<String>,
    api_key: Option<String>,
    client_id: Option<String>,
) -> Config {
    let mut next = cur.clone();
    if let Some(u) = user {
        next.lastfm.user = u;
    }
    if let Some(k) = api_key {
        next.lastfm.api_key = k;
    }
    if let Some(c) = client_id {
        next.discord.client_id = c;
    }
    next
}

async fn handle_ctl(ctx: &Arc<Ctx>, session: Option<Session>, req: CtlRequest) -> Option<Session> {
    let CtlRequest { cmd, reply } = req;
    match cmd {
        CtlCmd::Start => {
            let session = if session.is_some() {
                session
            } else {
                start_session(ctx)
            };
            let _ = reply.send(json!({"ok": true, "running": session.is_some()}));
            session
        }
        CtlCmd::Stop => {
            if let Some(s) = session {
                stop_session(s).await;
            }
            let _ = reply.send(json!({"ok": true}));
            None
        }
        CtlCmd::Status => {
            let configured = ctx.cfg.read().unwrap().is_valid();
            let conn = ctx.conn.read().unwrap().as_str();
            let _ = reply.send(json!({
                "ok": true,
                "running": session.is_some(),
                "connection": conn,
                "configured": configured,
            }));
            session
        }
        CtlCmd::GetConfig => {
            let cfg = ctx.cfg.read().unwrap().clone();
            let _ = reply.send(json!({
                "ok": true,
                "config": {
                    "user": cfg.lastfm.user,
                    "api_key": cfg.lastfm.api_key,
                    "client_id": cfg.discord.client_id,
                },
            }));
            session
        }
        CtlCmd::SetConfig {
            user,
            api_key,
            client_id,
        } => {
            let new_cfg = {
                let cur = ctx.cfg.read().unwrap();
                merged(&cur, user, api_key, client_id)
            };
            if let Err(e) = write_config(&ctx.config_path, &new_cfg) {
                eprintln!("scrobble-bridge: saving config failed: {e:#}");
            }
            let session = apply_config(ctx, session, new_cfg).await;
            let _ = reply.send(json!({"ok": true, "running": session.is_some()}));
            session
        }
    }
}

async fn ipc_server(ctl_tx: mpsc::UnboundedSender<CtlRequest>) -> Result<()> {
    // $XDG_RUNTIME_DIR/scrobble-bridge/scrobble-bridge.sock
    let dir = format!("{}/scrobble-bridge", runtime_dir());
    let sock = format!("{dir}/scrobble-bridge.sock");
    fs::create_dir_all(&dir)?;
    let _ = fs::remove_file(&sock);
    let listener = UnixListener::bind(&sock)?;
    let _ = fs::set_permissions(&sock, fs::Permissions::from_mode(0o600));

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = ctl_tx.clone();
                task::spawn(async move {
                    handle_ctl_stream(tx, stream).await;
                });
            }
            Err(e) => {
                eprintln!("scrobble-bridge: ipc accept error: {e:#}");
            }
        }
    }
}

async fn handle_ctl_stream(ctl_tx: mpsc::UnboundedSender<CtlRequest>, stream: UnixStream) {
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let txt = line.trim();
        if txt.is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<CtlCmd>(txt) {
            Ok(cmd) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if ctl_tx
                    .send(CtlRequest {
                        cmd,
                        reply: reply_tx,
                    })
                    .is_err()
                {
                    break;
                }
                reply_rx.await.unwrap_or_else(|_| json!({"ok": false}))
            }
            Err(_) => json!({"ok": false}),
        };
        let mut out = reply.to_string();
        out.push('\n');
        if w.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

// ------------------------- Config I/O -------------------------

fn config_file_path() -> Result<PathBuf> {
    let cfg_dir = dirs::config_dir().context("no XDG_CONFIG_HOME")?;
    Ok(cfg_dir.join("scrobble-bridge").join("config.toml"))
}

// A missing file is not an error: the daemon idles unconfigured until the
// control surface supplies credentials.
fn read_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text =
        fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
    let cfg: Config = toml::from_str(&text).context("parsing toml")?;
    Ok(cfg)
}

fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(p) = path.parent() {
        let _ = fs::create_dir_all(p);
    }
    let text = toml::to_string_pretty(cfg).context("serializing config")?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, text.as_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ------------------------- Main -------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_file_path()?;
    let cfg = read_config(&config_path)?;
    let ctx = Arc::new(Ctx::new(cfg, config_path));
    ensure_dirs(&ctx);

    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel::<CtlRequest>();
    let ipc_tx = ctl_tx.clone();
    task::spawn(async move {
        if let Err(e) = ipc_server(ipc_tx).await {
            eprintln!("scrobble-bridge: ipc server error: {e:#}");
        }
    });

    let mut session = start_session(&ctx);
    if session.is_none() {
        eprintln!(
            "scrobble-bridge: not configured yet (set credentials via scrobble-bridgec set-config)"
        );
    }

    let mut hup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            Some(req) = ctl_rx.recv() => {
                session = handle_ctl(&ctx, session, req).await;
            }
            _ = hup.recv() => {
                match read_config(&ctx.config_path) {
                    Ok(cfg) => {
                        eprintln!("scrobble-bridge: SIGHUP received, reloading config");
                        session = apply_config(&ctx, session, cfg).await;
                    }
                    Err(e) => eprintln!("scrobble-bridge: config reload failed: {e:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if let Some(s) = session.take() {
                    stop_session(s).await;
                }
                break;
            }
        }
    }
    Ok(())
}

// ------------------------- Tests -------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> Config {
        Config {
            lastfm: Lastfm {
                user: "alice".into(),
                api_key: "k1".into(),
            },
            discord: Discord {
                client_id: "123456789".into(),
            },
            ..Config::default()
        }
    }

    fn test_ctx(dir: &Path) -> Ctx {
        Ctx {
            config_path: dir.join("config.toml"),
            cache_dir: dir.to_path_buf(),
            http: reqwest::Client::new(),
            cfg: RwLock::new(full_config()),
            conn: RwLock::new(ConnState::Disconnected),
            relay_locks: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn config_requires_all_fields() {
        assert!(full_config().is_valid());
        assert!(!Config::default().is_valid());

        let mut cfg = full_config();
        cfg.lastfm.user = String::new();
        assert!(!cfg.is_valid());

        let mut cfg = full_config();
        cfg.lastfm.api_key = String::new();
        assert!(!cfg.is_valid());

        let mut cfg = full_config();
        cfg.discord.client_id = String::new();
        assert!(!cfg.is_valid());
    }

    #[test]
    fn config_merge_is_per_field() {
        let cur = full_config();
        let next = merged(&cur, None, Some("k2".into()), None);
        assert_eq!(next.lastfm.user, "alice");
        assert_eq!(next.lastfm.api_key, "k2");
        assert_eq!(next.discord.client_id, "123456789");

        let next = merged(&cur, Some("bob".into()), None, Some("42".into()));
        assert_eq!(next.lastfm.user, "bob");
        assert_eq!(next.lastfm.api_key, "k1");
        assert_eq!(next.discord.client_id, "42");
    }

    #[test]
    fn art_cache_key_is_stable_hex() {
        let a = art_cache_key("https://img.example/big.jpg");
        let b = art_cache_key("https://img.example/big.jpg");
        let c = art_cache_key("https://img.example/other.jpg");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 40);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    fn parse(json: &str) -> Option<NowPlaying> {
        interpret_recent(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn now_playing_full_shape() {
        let now = parse(
            r##"{"recenttracks":{"track":[{
                "name":"Song A",
                "artist":{"#text":"Band X"},
                "album":{"#text":"LP"},
                "image":[
                    {"size":"small","#text":"https://img.example/s.jpg"},
                    {"size":"extralarge","#text":"https://img.example/big.jpg"}
                ],
                "@attr":{"nowplaying":"true"}
            }]}}"##,
        )
        .expect("live track");
        assert_eq!(now.title, "Song A");
        assert_eq!(now.artist, "Band X");
        assert_eq!(now.album, "LP");
        assert_eq!(now.image_url.as_deref(), Some("https://img.example/big.jpg"));
    }

    #[test]
    fn now_playing_requires_live_marker() {
        // Historical entry: no "@attr" at all.
        let json = r##"{"recenttracks":{"track":[{
            "name":"Song A",
            "artist":{"#text":"Band X"},
            "album":{"#text":"LP"},
            "image":[]
        }]}}"##;
        assert!(parse(json).is_none());

        // "@attr" present but no nowplaying flag.
        let json = r##"{"recenttracks":{"track":[{
            "name":"Song A","@attr":{}
        }]}}"##;
        assert!(parse(json).is_none());

        assert!(parse(r#"{"recenttracks":{"track":[]}}"#).is_none());
    }

    #[test]
    fn now_playing_tolerates_missing_fields() {
        // Empty album text and no extralarge variant: album degrades to "",
        // artwork to absent, and the track still counts as playing.
        let now = parse(
            r##"{"recenttracks":{"track":[{
                "name":"Song A",
                "artist":{"#text":"Band X"},
                "album":{"#text":""},
                "image":[{"size":"small","#text":"https://img.example/s.jpg"}],
                "@attr":{"nowplaying":"true"}
            }]}}"##,
        )
        .expect("live track");
        assert_eq!(now.album, "");
        assert!(now.image_url.is_none());

        // Blank "#text" on the extralarge slot is not a usable URL.
        let now = parse(
            r##"{"recenttracks":{"track":[{
                "name":"Song A",
                "image":[{"size":"extralarge","#text":""}],
                "@attr":{"nowplaying":"true"}
            }]}}"##,
        )
        .expect("live track");
        assert_eq!(now.artist, "");
        assert!(now.image_url.is_none());
    }

    #[test]
    fn error_body_reads_as_not_playing() {
        assert!(parse(r#"{"error":10,"message":"Invalid API key"}"#).is_none());
    }

    #[tokio::test]
    async fn relay_prefers_cached_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let key = art_cache_key("https://img.example/big.jpg");
        fs::write(
            dir.path().join(format!("{key}.txt")),
            "https://files.catbox.moe/abc.png\n",
        )
        .unwrap();

        let hosted = resolve_cover(&ctx, "https://img.example/big.jpg")
            .await
            .unwrap();
        assert_eq!(hosted, "https://files.catbox.moe/abc.png");
    }

    #[tokio::test]
    async fn pipeline_clears_without_track() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();

        apply_update(&ctx, &tx, None).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), PresenceCmd::Clear));
    }

    #[tokio::test]
    async fn pipeline_clears_without_artwork() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let track = NowPlaying {
            title: "Song A".into(),
            artist: "Band X".into(),
            album: "LP".into(),
            image_url: None,
        };
        apply_update(&ctx, &tx, Some(track)).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), PresenceCmd::Clear));
    }

    #[tokio::test]
    async fn pipeline_publishes_with_cached_art() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let key = art_cache_key("https://img.example/big.jpg");
        fs::write(
            dir.path().join(format!("{key}.txt")),
            "https://files.catbox.moe/abc.png",
        )
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let track = NowPlaying {
            title: "Song A".into(),
            artist: "Band X".into(),
            album: "LP".into(),
            image_url: Some("https://img.example/big.jpg".into()),
        };
        apply_update(&ctx, &tx, Some(track)).await.unwrap();
        match rx.try_recv().unwrap() {
            PresenceCmd::Publish(t, hosted) => {
                assert_eq!(t.title, "Song A");
                assert_eq!(hosted, "https://files.catbox.moe/abc.png");
            }
            other => panic!("expected publish, got {other:?}"),
        }
    }

    #[test]
    fn ctl_set_config_parses_partial() {
        let cmd: CtlCmd = serde_json::from_str(
            r#"{"cmd":"set-config","user":"bob","api_key":null,"client_id":null}"#,
        )
        .unwrap();
        match cmd {
            CtlCmd::SetConfig {
                user,
                api_key,
                client_id,
            } => {
                assert_eq!(user.as_deref(), Some("bob"));
                assert!(api_key.is_none());
                assert!(client_id.is_none());
            }
            other => panic!("expected set-config, got {other:?}"),
        }
    }
}
