//! HTTP client for a simulator bridge
//!
//! The bridge exposes the simulator's command/query interface as JSON
//! endpoints under `/api`. Calls are async internally and driven to
//! completion on a shared tokio runtime, so the rest of the crate sees a
//! plain blocking [`Engine`].

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{Blueprint, BlueprintLibrary, Engine, RawImage, SensorCallback, WalkerControl};
use crate::batch::{Command, CommandResponse};
use crate::core::config::ServerConfig;
use crate::core::error::{CaptureError, Result};
use crate::core::types::{ActorId, Location, Tick, Transform};

/// Pause between reconnect attempts of a sensor stream
const STREAM_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How long one frame long-poll may stay open; replaces the client timeout
const STREAM_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Blocking engine facade over the bridge's JSON API
pub struct RemoteEngine {
    client: Client,
    base_url: String,
    runtime: Handle,
    streams: Mutex<HashMap<ActorId, JoinHandle<()>>>,
}

impl RemoteEngine {
    /// Create a client with explicit configuration
    pub fn new(base_url: String, timeout: Duration, runtime: Handle) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            runtime,
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &ServerConfig, runtime: Handle) -> Result<Self> {
        Self::new(config.base_url(), config.timeout()?, runtime)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.client.get(self.url(path));
        self.block_on(async move { decode(request.send().await?).await })
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let request = self.client.post(self.url(path)).json(body);
        self.block_on(async move { decode(request.send().await?).await })
    }
}

impl Drop for RemoteEngine {
    fn drop(&mut self) {
        if let Ok(mut streams) = self.streams.lock() {
            for (_, handle) in streams.drain() {
                handle.abort();
            }
        }
    }
}

async fn check(response: Response) -> Result<Response> {
    if !response.status().is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(CaptureError::Engine(format!("API error: {}", error_text)));
    }
    Ok(response)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    Ok(check(response).await?.json().await?)
}

/// 404 means the actor is gone; any other failure is an error
async fn found(response: Response) -> Result<bool> {
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(false);
    }
    check(response).await?;
    Ok(true)
}

fn header_u64(response: &Response, name: &str) -> Result<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| CaptureError::Engine(format!("frame response missing {} header", name)))
}

/// Long-poll the next frame after `after`; `None` when the poll timed out
async fn fetch_frame(
    client: &Client,
    url: &str,
    after: u64,
    poll_timeout: Duration,
) -> Result<Option<RawImage>> {
    let request = client.get(url).query(&[("after", after)]).timeout(poll_timeout);
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let response = check(response).await?;

    let frame = header_u64(&response, "x-frame")?;
    let width = header_u64(&response, "x-width")? as u32;
    let height = header_u64(&response, "x-height")? as u32;
    let data = response.bytes().await?.to_vec();
    Ok(Some(RawImage {
        frame,
        width,
        height,
        data,
    }))
}

// Bridge API payloads
#[derive(Serialize)]
struct LoadWorldRequest<'a> {
    map: &'a str,
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    commands: &'a [Command],
    synchronous: bool,
}

#[derive(Serialize)]
struct SpawnActorRequest<'a> {
    blueprint: &'a Blueprint,
    transform: &'a Transform,
    parent: Option<ActorId>,
}

#[derive(Deserialize)]
struct SpawnActorResponse {
    actor_id: ActorId,
}

#[derive(Serialize)]
struct CrowdControlRequest {
    enabled: bool,
}

#[derive(Deserialize)]
struct TickResponse {
    tick: Tick,
}

#[derive(Deserialize)]
struct Ack {}

impl Engine for RemoteEngine {
    fn load_world(&self, map: &str) -> Result<()> {
        let _: Ack = self.post("world/load", &LoadWorldRequest { map })?;
        Ok(())
    }

    fn blueprint_library(&self) -> Result<BlueprintLibrary> {
        let blueprints: Vec<Blueprint> = self.get("blueprints")?;
        Ok(BlueprintLibrary::new(blueprints))
    }

    fn spawn_points(&self) -> Result<Vec<Transform>> {
        self.get("map/spawn_points")
    }

    fn random_navigable_location(&self) -> Result<Option<Location>> {
        self.get("navigation/random_location")
    }

    fn apply_batch(&self, commands: &[Command], synchronous: bool) -> Result<Vec<CommandResponse>> {
        self.post("batch", &BatchRequest {
            commands,
            synchronous,
        })
    }

    fn spawn_actor(
        &self,
        blueprint: &Blueprint,
        transform: &Transform,
        parent: Option<ActorId>,
    ) -> Result<ActorId> {
        let response: SpawnActorResponse = self.post(
            "actors",
            &SpawnActorRequest {
                blueprint,
                transform,
                parent,
            },
        )?;
        Ok(response.actor_id)
    }

    fn actor_exists(&self, id: ActorId) -> Result<bool> {
        let request = self.client.get(self.url(&format!("actors/{}", id.0)));
        self.block_on(async move { found(request.send().await?).await })
    }

    fn walker_control(&self, controller: ActorId, control: WalkerControl) -> Result<()> {
        let _: Ack = self.post(&format!("walkers/{}/control", controller.0), &control)?;
        Ok(())
    }

    fn set_crowd_control(&self, vehicle: ActorId, enabled: bool) -> Result<()> {
        let path = format!("vehicles/{}/crowd", vehicle.0);
        let _: Ack = self.post(&path, &CrowdControlRequest { enabled })?;
        Ok(())
    }

    fn wait_for_tick(&self) -> Result<Tick> {
        let response: TickResponse = self.post("tick/wait", &serde_json::json!({}))?;
        Ok(response.tick)
    }

    fn listen(&self, sensor: ActorId, callback: SensorCallback) -> Result<()> {
        let client = self.client.clone();
        let url = self.url(&format!("sensors/{}/frames", sensor.0));

        let handle = self.runtime.spawn(async move {
            let mut after = 0;
            loop {
                match fetch_frame(&client, &url, after, STREAM_POLL_TIMEOUT).await {
                    Ok(Some(image)) => {
                        after = image.frame;
                        callback(image);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(%sensor, error = %e, "sensor stream interrupted, retrying");
                        tokio::time::sleep(STREAM_RETRY_DELAY).await;
                    }
                }
            }
        });

        let mut streams = self
            .streams
            .lock()
            .map_err(|_| CaptureError::Engine("sensor stream table poisoned".into()))?;
        if let Some(previous) = streams.insert(sensor, handle) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_listening(&self, sensor: ActorId) -> Result<()> {
        let handle = self
            .streams
            .lock()
            .map_err(|_| CaptureError::Engine("sensor stream table poisoned".into()))?
            .remove(&sensor);
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let engine = RemoteEngine::new(
            "http://127.0.0.1:2000/".into(),
            Duration::from_secs(2),
            runtime.handle().clone(),
        )
        .unwrap();
        assert_eq!(engine.url("batch"), "http://127.0.0.1:2000/api/batch");
        assert_eq!(engine.url("actors/7"), "http://127.0.0.1:2000/api/actors/7");
    }

    #[test]
    fn test_from_config_uses_host_and_port() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let config = ServerConfig {
            host: "10.0.0.5".into(),
            port: 2010,
            ..Default::default()
        };
        let engine = RemoteEngine::from_config(&config, runtime.handle().clone()).unwrap();
        assert_eq!(engine.url("tick/wait"), "http://10.0.0.5:2010/api/tick/wait");
    }

    #[test]
    fn test_negative_timeout_is_config_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let config = ServerConfig {
            timeout_secs: -1.0,
            ..Default::default()
        };
        let result = RemoteEngine::from_config(&config, runtime.handle().clone());
        assert!(matches!(result, Err(CaptureError::Config(_))));
    }

    #[test]
    fn test_idle_frame_poll_is_empty_not_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        // Accepts the connection but never answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/api/sensors/1/frames", listener.local_addr().unwrap());
        let client = Client::builder().timeout(Duration::from_secs(5)).build().unwrap();

        let frame = runtime.block_on(fetch_frame(&client, &url, 0, Duration::from_millis(100)));

        assert!(matches!(frame, Ok(None)));
        drop(listener);
    }

    #[test]
    fn test_unreachable_bridge_is_engine_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let engine = RemoteEngine::new(
            "http://127.0.0.1:1".into(),
            Duration::from_millis(200),
            runtime.handle().clone(),
        )
        .unwrap();
        assert!(engine.spawn_points().is_err());
    }
}
