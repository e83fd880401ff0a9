//! In-memory dhub backend shared by the integration tests
//!
//! Serves the same routes as the hosted backend, records every request and
//! can be told to slow down or fail the bundle write endpoints.

#![allow(dead_code)]

use bytes::Bytes;
use dhub_client::{
    bundle, ClientConfig, DatasetRecord, DhubError, ElementData, ElementRecord, Query, Result,
    Session, Transport,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TOKEN: &str = "test-token";
pub const OWNER: &str = "tester";

/// One request seen by the fake backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: &'static str,
    pub path: String,
    /// Elements carried by a bundle request, 0 otherwise
    pub items: usize,
}

#[derive(Clone)]
struct StoredElement {
    id: String,
    data: ElementData,
    content: Option<Bytes>,
}

impl StoredElement {
    fn to_json(&self) -> Value {
        serde_json::to_value(ElementRecord {
            id: self.id.clone(),
            data: self.data.clone(),
            comments_count: 0,
            has_content: self.content.is_some(),
        })
        .unwrap()
    }
}

#[derive(Clone)]
struct StoredDataset {
    record: DatasetRecord,
    elements: Vec<StoredElement>,
    /// Owned by another token until linked
    hidden: bool,
}

impl StoredDataset {
    fn to_json(&self) -> Value {
        let mut record = self.record.clone();
        record.elements_count = self.elements.len();
        record.size = self.size();
        serde_json::to_value(record).unwrap()
    }

    fn size(&self) -> u64 {
        self.elements
            .iter()
            .filter_map(|e| e.content.as_ref())
            .map(|c| c.len() as u64)
            .sum()
    }

    fn find(&mut self, id: &str) -> Option<&mut StoredElement> {
        self.elements.iter_mut().find(|e| e.id == id)
    }
}

#[derive(Default)]
struct State {
    datasets: BTreeMap<String, StoredDataset>,
    next_id: u64,
}

enum Body<'a> {
    None,
    Json(&'a Value),
    Binary(Bytes),
}

impl Body<'_> {
    fn json(&self) -> Value {
        match self {
            Body::Json(value) => (*value).clone(),
            _ => Value::Null,
        }
    }
}

enum Reply {
    Json(Value),
    Binary(Bytes),
}

pub struct FakeDhub {
    page_size: usize,
    state: Mutex<State>,
    calls: Mutex<Vec<Call>>,
    fail_writes: AtomicBool,
    write_delay: Mutex<Duration>,
}

impl FakeDhub {
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            state: Mutex::new(State::default()),
            calls: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            write_delay: Mutex::new(Duration::ZERO),
        })
    }

    // ==================== Seeding ====================

    pub fn add_dataset(&self, url_prefix: &str) {
        self.insert_dataset(url_prefix, false);
    }

    /// Dataset owned by someone else, invisible until linked
    pub fn add_foreign_dataset(&self, url_prefix: &str) {
        self.insert_dataset(url_prefix, true);
    }

    fn insert_dataset(&self, url_prefix: &str, hidden: bool) {
        let dataset = StoredDataset {
            record: DatasetRecord {
                url_prefix: url_prefix.to_string(),
                title: url_prefix.rsplit('/').next().unwrap_or_default().to_string(),
                ..Default::default()
            },
            elements: Vec::new(),
            hidden,
        };
        self.state.lock().unwrap().datasets.insert(url_prefix.to_string(), dataset);
    }

    /// Append an element with a fixed id
    pub fn seed(&self, url_prefix: &str, id: &str, title: &str, content: Option<&[u8]>) {
        let mut state = self.state.lock().unwrap();
        let dataset = state.datasets.get_mut(url_prefix).expect("seeded dataset exists");
        dataset.elements.push(StoredElement {
            id: id.to_string(),
            data: ElementData {
                title: title.to_string(),
                ..Default::default()
            },
            content: content.map(Bytes::copy_from_slice),
        });
    }

    /// Remove an element behind the client's back
    pub fn drop_element(&self, url_prefix: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(dataset) = state.datasets.get_mut(url_prefix) {
            dataset.elements.retain(|e| e.id != id);
        }
    }

    // ==================== Inspection ====================

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls with `method` whose path ends with `suffix`
    pub fn calls_to(&self, method: &str, suffix: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method && call.path.ends_with(suffix))
            .collect()
    }

    /// Bundle writes (metadata patches and content uploads) in arrival order
    pub fn flushes(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|call| is_flush(call.method, &call.path)).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn content_of(&self, url_prefix: &str, id: &str) -> Option<Bytes> {
        let mut state = self.state.lock().unwrap();
        state.datasets.get_mut(url_prefix)?.find(id)?.content.clone()
    }

    pub fn title_of(&self, url_prefix: &str, id: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        Some(state.datasets.get_mut(url_prefix)?.find(id)?.data.title.clone())
    }

    pub fn element_count(&self, url_prefix: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.datasets.get(url_prefix).map_or(0, |d| d.elements.len())
    }

    pub fn has_dataset(&self, url_prefix: &str) -> bool {
        self.state.lock().unwrap().datasets.contains_key(url_prefix)
    }

    // ==================== Behaviour ====================

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    async fn serve(&self, method: &'static str, path: &str, query: Query<'_>, body: Body<'_>) -> Result<Reply> {
        let items = bundle_items(method, path, &body);
        self.calls.lock().unwrap().push(Call {
            method,
            path: path.to_string(),
            items,
        });

        if is_flush(method, path) {
            let delay = *self.write_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DhubError::Transport {
                    status: 500,
                    message: "bundle write failed".into(),
                });
            }
        }

        self.route(method, path, query, body)
    }

    fn route(&self, method: &str, path: &str, query: Query<'_>, body: Body<'_>) -> Result<Reply> {
        let mut state = self.state.lock().unwrap();
        let parts: Vec<&str> = path.split('/').collect();

        let reply = match (method, parts.as_slice()) {
            ("GET", ["server"]) => json!({ "Page-Size": self.page_size }),
            ("GET", ["tokens", _]) => json!({ "prefix": OWNER }),
            ("POST", ["tokens", _, "link", owner, name]) => {
                let prefix = format!("{}/{}", owner, name);
                let dataset = state.datasets.get_mut(&prefix).ok_or_else(|| not_found(&prefix))?;
                dataset.hidden = false;
                Value::Null
            }
            ("GET", ["datasets"]) => Value::Array(
                state
                    .datasets
                    .values()
                    .filter(|d| !d.hidden)
                    .map(StoredDataset::to_json)
                    .collect(),
            ),
            ("POST", ["datasets"]) => {
                let body = body.json();
                let prefix = owned(body["url_prefix"].as_str().unwrap_or_default());
                if state.datasets.contains_key(&prefix) {
                    return Err(DhubError::Transport {
                        status: 409,
                        message: format!("{} already exists", prefix),
                    });
                }
                let record = DatasetRecord {
                    url_prefix: prefix.clone(),
                    title: body["title"].as_str().unwrap_or_default().to_string(),
                    description: body["description"].as_str().unwrap_or_default().to_string(),
                    ..Default::default()
                };
                let dataset = StoredDataset {
                    record,
                    elements: Vec::new(),
                    hidden: false,
                };
                let reply = dataset.to_json();
                state.datasets.insert(prefix, dataset);
                reply
            }
            (_, ["datasets", owner, name, rest @ ..]) => {
                let prefix = format!("{}/{}", owner, name);
                return self.dataset_route(&mut state, method, &prefix, rest, query, body);
            }
            _ => return Err(not_found(path)),
        };

        Ok(Reply::Json(reply))
    }

    fn dataset_route(
        &self,
        state: &mut State,
        method: &str,
        prefix: &str,
        rest: &[&str],
        query: Query<'_>,
        body: Body<'_>,
    ) -> Result<Reply> {
        if !state.datasets.contains_key(prefix) {
            return Err(not_found(prefix));
        }

        match (method, rest) {
            ("DELETE", []) => {
                state.datasets.remove(prefix);
                return Ok(Reply::Json(Value::Null));
            }
            ("POST", ["fork", _]) => return Ok(Reply::Json(fork(state, prefix, &body.json()))),
            _ => {}
        }

        let page_size = self.page_size;
        let next_id = &mut state.next_id;
        let dataset = state
            .datasets
            .get_mut(prefix)
            .ok_or_else(|| not_found(prefix))?;

        let reply = match (method, rest) {
            ("GET", []) => dataset.to_json(),
            ("PATCH", []) => {
                let patch = body.json();
                if let Some(title) = patch["title"].as_str() {
                    dataset.record.title = title.to_string();
                }
                if let Some(description) = patch["description"].as_str() {
                    dataset.record.description = description.to_string();
                }
                Value::Null
            }
            ("GET", ["size"]) => json!(dataset.size()),

            ("GET", ["elements"]) => {
                let page: usize = query
                    .iter()
                    .find(|(name, _)| *name == "page")
                    .and_then(|(_, value)| value.parse().ok())
                    .unwrap_or(0);
                let options = body.json()["options"].clone();
                Value::Array(
                    dataset
                        .elements
                        .iter()
                        .filter(|e| matches_options(e, &options))
                        .skip(page * page_size)
                        .take(page_size)
                        .map(StoredElement::to_json)
                        .collect(),
                )
            }
            ("POST", ["elements"]) => {
                let data: ElementData = serde_json::from_value(body.json()).unwrap();
                *next_id += 1;
                let id = format!("e{}", next_id);
                dataset.elements.push(StoredElement {
                    id: id.clone(),
                    data,
                    content: None,
                });
                json!(id)
            }

            ("GET", ["elements", "bundle"]) => {
                let ids = requested_ids(&body);
                Value::Array(
                    ids.iter()
                        .filter_map(|id| dataset.find(id).map(|e| e.to_json()))
                        .collect(),
                )
            }
            ("POST", ["elements", "bundle"]) => {
                let list: Vec<ElementData> =
                    serde_json::from_value(body.json()["elements"].clone()).unwrap();
                let mut created = Vec::new();
                for data in list {
                    *next_id += 1;
                    let element = StoredElement {
                        id: format!("e{}", next_id),
                        data,
                        content: None,
                    };
                    created.push(element.to_json());
                    dataset.elements.push(element);
                }
                Value::Array(created)
            }
            ("PATCH", ["elements", "bundle"]) => {
                let patch = body.json();
                let elements = patch["elements"].as_object().cloned().unwrap_or_default();
                for (id, data) in elements {
                    if let Some(element) = dataset.find(&id) {
                        merge(&mut element.data, &data);
                    }
                }
                Value::Null
            }
            ("DELETE", ["elements", "bundle"]) => {
                let ids: BTreeSet<String> = requested_ids(&body).into_iter().collect();
                dataset.elements.retain(|e| !ids.contains(&e.id));
                Value::Null
            }

            ("GET", ["elements", "content"]) => {
                let ids = requested_ids(&body);
                let found: Vec<(String, Bytes)> = ids
                    .iter()
                    .filter_map(|id| {
                        let element = dataset.find(id)?;
                        Some((id.clone(), element.content.clone()?))
                    })
                    .collect();
                let packed = bundle::pack(found.iter().map(|(id, c)| (id.as_str(), &c[..])))?;
                return Ok(Reply::Binary(packed));
            }
            ("PUT", ["elements", "content"]) => {
                let Body::Binary(packet) = &body else {
                    return Err(bad_request("content bundle expected"));
                };
                for (id, content) in bundle::unpack(packet)? {
                    if let Some(element) = dataset.find(&id) {
                        element.content = Some(content);
                    }
                }
                Value::Null
            }

            ("GET", ["elements", id]) => dataset.find(id).ok_or_else(|| not_found(id))?.to_json(),
            ("PATCH", ["elements", id]) => {
                let element = dataset.find(id).ok_or_else(|| not_found(id))?;
                merge(&mut element.data, &body.json());
                Value::Null
            }
            ("DELETE", ["elements", id]) => {
                let before = dataset.elements.len();
                dataset.elements.retain(|e| e.id != *id);
                if dataset.elements.len() == before {
                    return Err(not_found(id));
                }
                Value::Null
            }
            ("GET", ["elements", id, "content"]) => {
                let element = dataset.find(id).ok_or_else(|| not_found(id))?;
                let content = element.content.clone().ok_or_else(|| not_found(id))?;
                return Ok(Reply::Binary(content));
            }
            ("PUT", ["elements", id, "content"]) => {
                let Body::Binary(content) = &body else {
                    return Err(bad_request("content expected"));
                };
                let element = dataset.find(id).ok_or_else(|| not_found(id))?;
                element.content = Some(content.clone());
                Value::Null
            }

            _ => return Err(not_found(&rest.join("/"))),
        };

        Ok(Reply::Json(reply))
    }
}

#[async_trait::async_trait]
impl Transport for FakeDhub {
    async fn get_json(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Value> {
        json_reply(self.serve("GET", path, query, json_body(body)).await?)
    }

    async fn get_binary(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Bytes> {
        match self.serve("GET", path, query, json_body(body)).await? {
            Reply::Binary(bytes) => Ok(bytes),
            Reply::Json(value) => Ok(Bytes::from(value.to_string())),
        }
    }

    async fn post_json(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Value> {
        json_reply(self.serve("POST", path, query, json_body(body)).await?)
    }

    async fn patch_json(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Value> {
        json_reply(self.serve("PATCH", path, query, json_body(body)).await?)
    }

    async fn put_binary(&self, path: &str, query: Query<'_>, body: Bytes) -> Result<Value> {
        json_reply(self.serve("PUT", path, query, Body::Binary(body)).await?)
    }

    async fn delete_json(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Value> {
        json_reply(self.serve("DELETE", path, query, json_body(body)).await?)
    }
}

/// Copy `prefix` under the requested url prefix
fn fork(state: &mut State, prefix: &str, request: &Value) -> Value {
    let mut copy = state.datasets[prefix].clone();
    let new_prefix = owned(request["url_prefix"].as_str().unwrap_or_default());
    copy.record.url_prefix = new_prefix.clone();
    copy.record.fork_father = Some(prefix.to_string());
    copy.record.fork_count = 0;
    copy.hidden = false;
    if let Some(title) = request["title"].as_str() {
        copy.record.title = title.to_string();
    }

    let reply = copy.to_json();
    state.datasets.insert(new_prefix, copy);
    if let Some(source) = state.datasets.get_mut(prefix) {
        source.record.fork_count += 1;
    }
    reply
}

fn json_body(body: Option<&Value>) -> Body<'_> {
    body.map_or(Body::None, Body::Json)
}

fn json_reply(reply: Reply) -> Result<Value> {
    match reply {
        Reply::Json(value) => Ok(value),
        Reply::Binary(_) => Err(bad_request("binary reply on a JSON route")),
    }
}

fn is_flush(method: &str, path: &str) -> bool {
    (method == "PATCH" && path.ends_with("/elements/bundle"))
        || (method == "PUT" && path.ends_with("/elements/content"))
}

fn bundle_items(method: &str, path: &str, body: &Body<'_>) -> usize {
    match body {
        Body::Binary(packet) if method == "PUT" && path.ends_with("/elements/content") => {
            bundle::unpack(packet).map_or(0, |entries| entries.len())
        }
        Body::Json(value) if path.ends_with("/elements/bundle") || path.ends_with("/elements/content") => {
            match &value["elements"] {
                Value::Object(map) => map.len(),
                Value::Array(list) => list.len(),
                _ => 0,
            }
        }
        _ => 0,
    }
}

fn requested_ids(body: &Body<'_>) -> Vec<String> {
    body.json()["elements"]
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Filter options understood by the fake: `{"title": "..."}`
fn matches_options(element: &StoredElement, options: &Value) -> bool {
    match options.get("title").and_then(Value::as_str) {
        Some(title) => element.data.title == title,
        None => true,
    }
}

fn merge(data: &mut ElementData, patch: &Value) {
    let mut current = match serde_json::to_value(&*data).unwrap() {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    if let Value::Object(fields) = patch {
        for (name, value) in fields {
            current.insert(name.clone(), value.clone());
        }
    }
    *data = serde_json::from_value(Value::Object(current)).unwrap();
}

/// Prefixes without an owner land in the token's namespace
fn owned(prefix: &str) -> String {
    if prefix.contains('/') {
        prefix.to_string()
    } else {
        format!("{}/{}", OWNER, prefix)
    }
}

fn not_found(what: &str) -> DhubError {
    DhubError::NotFound(format!("{} not found", what))
}

fn bad_request(message: &str) -> DhubError {
    DhubError::Transport {
        status: 400,
        message: message.to_string(),
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast-flushing configuration for tests
pub fn test_config() -> ClientConfig {
    ClientConfig {
        flush_interval: Duration::from_millis(10),
        await_timeout: Duration::from_secs(5),
        rate_limit_backoff: Duration::from_millis(1),
        ..ClientConfig::new("http://dhub.test", TOKEN)
    }
}

pub async fn connect(fake: &Arc<FakeDhub>) -> Session {
    connect_with(fake, test_config()).await
}

pub async fn connect_with(fake: &Arc<FakeDhub>, config: ClientConfig) -> Session {
    init_tracing();
    let transport: Arc<dyn Transport> = fake.clone();
    Session::with_transport(config, transport).await.unwrap()
}

/// `tester/faces` with five elements `a`..`e`; `a`, `c` and `e` carry content
pub fn faces(page_size: usize) -> Arc<FakeDhub> {
    let fake = FakeDhub::new(page_size);
    fake.add_dataset("tester/faces");
    fake.seed("tester/faces", "a", "cat", Some(b"content-a"));
    fake.seed("tester/faces", "b", "dog", None);
    fake.seed("tester/faces", "c", "cat", Some(b"content-c"));
    fake.seed("tester/faces", "d", "bird", None);
    fake.seed("tester/faces", "e", "cat", Some(b"content-e"));
    fake
}
