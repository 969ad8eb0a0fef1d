use super::*;

use std::path::Path;
use std::time::UNIX_EPOCH;

use serde_json::json;
use sqlx::SqlitePool;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::sync::journal::ConflictRecord;

async fn make_propagator(
    server: &MockServer,
    root: &Path,
) -> (Arc<Propagator>, UnboundedReceiver<PropagatorEvent>) {
    make_propagator_with_vfs(server, root, Arc::new(VfsOff)).await
}

async fn make_propagator_with_vfs(
    server: &MockServer,
    root: &Path,
    vfs: Arc<dyn Vfs>,
) -> (Arc<Propagator>, UnboundedReceiver<PropagatorEvent>) {
    let account = Account::with_base_url(&server.uri(), "demo", "secret").unwrap();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let journal = SyncJournal::from_pool(pool);
    journal.init().await.unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let propagator =
        Propagator::new(account, journal, root.to_path_buf(), events_tx).with_vfs(vfs);
    (Arc::new(propagator), events_rx)
}

fn make_job(propagator: &Arc<Propagator>, items: Vec<SyncFileItem>) -> BulkPropagatorJob {
    BulkPropagatorJob::new(Arc::clone(propagator), items.into())
}

fn set_mtime(path: &Path, unix_secs: i64) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(unix_secs as u64))
        .unwrap();
}

/// Writes a file whose mtime is an hour old, well past the minimum file age.
fn aged_file(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, contents).unwrap();
    set_mtime(&path, now_unix() - 3600);
}

fn queued_item(root: &Path, rel: &str) -> SyncFileItem {
    let path = root.join(rel);
    let size = std::fs::metadata(&path).unwrap().len() as i64;
    let modtime = filesystem::get_modtime(&path).unwrap();
    SyncFileItem::new(rel, size, modtime, Instruction::New)
}

fn drain_events(events_rx: &mut UnboundedReceiver<PropagatorEvent>) -> Vec<PropagatorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }
    events
}

fn completed_items(events: &[PropagatorEvent]) -> Vec<&SyncFileItem> {
    events
        .iter()
        .filter_map(|event| match event {
            PropagatorEvent::ItemCompleted(item) => Some(item),
            _ => None,
        })
        .collect()
}

fn finished_statuses(events: &[PropagatorEvent]) -> Vec<ItemStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            PropagatorEvent::Finished(status) => Some(*status),
            _ => None,
        })
        .collect()
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header == name)
        .map(|(_, value)| value.as_str())
}

fn bulk_reply_entry(remote_path: &str, etag: &str, file_id: &str) -> serde_json::Value {
    json!({
        "X-File-Path": remote_path,
        "OC-ETag": format!("\"{etag}\""),
        "ETag": format!("\"{etag}\""),
        "OC-FileID": file_id,
        "X-OC-MTime": "accepted"
    })
}

async fn mount_bulk_reply(server: &MockServer, entries: Vec<serde_json::Value>) {
    Mock::given(method("POST"))
        .and(path("/remote.php/dav/bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::Value::Array(entries)))
        .mount(server)
        .await;
}

/// Appends to a local file while the server "handles" the request, emulating
/// the user writing into a file mid-upload.
struct GrowFileResponder {
    path: std::path::PathBuf,
    template: ResponseTemplate,
}

impl Respond for GrowFileResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .unwrap();
        file.write_all(b" grown while uploading").unwrap();
        self.template.clone()
    }
}

#[derive(Default)]
struct TestVfs {
    pin_states: Mutex<HashMap<String, PinState>>,
    set_calls: Mutex<Vec<(String, PinState)>>,
    fail_for: Option<String>,
    locked_for: Option<String>,
}

impl Vfs for TestVfs {
    fn pin_state(&self, file: &str) -> Option<PinState> {
        self.pin_states.lock().unwrap().get(file).copied()
    }

    fn set_pin_state(&self, file: &str, state: PinState) -> bool {
        self.set_calls
            .lock()
            .unwrap()
            .push((file.to_string(), state));
        self.pin_states
            .lock()
            .unwrap()
            .insert(file.to_string(), state);
        true
    }

    fn convert_to_placeholder(
        &self,
        item: &SyncFileItem,
        _local_path: &Path,
    ) -> Result<ConvertToPlaceholderResult, String> {
        if self.fail_for.as_deref() == Some(item.file.as_str()) {
            return Err("placeholder conversion failed".to_string());
        }
        if self.locked_for.as_deref() == Some(item.file.as_str()) {
            return Ok(ConvertToPlaceholderResult::Locked);
        }
        Ok(ConvertToPlaceholderResult::Ok)
    }
}

include!("part1.rs");
include!("part2.rs");
include!("part3a.rs");
include!("part3b.rs");
