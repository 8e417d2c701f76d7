//! Command implementations

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use simperium_client::{
    Bucket, BucketListener, BucketObject, ChangeType, ClientError, RevisionsCallbacks, Simperium,
};
use tokio::sync::oneshot;
use tracing::{debug, info};
use validator::Validate;

use crate::config::{Command, Settings, UserArgs};

pub async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    let simperium = Simperium::new(settings.client_config())?;
    let timeout = Duration::from_secs(settings.sync_timeout_secs);
    debug!("Session {}", simperium.session_id());

    match command {
        Command::Login(args) => login(&simperium, args, false).await,
        Command::Signup(args) => login(&simperium, args, true).await,
        Command::Logout => {
            simperium.deauthorize_user();
            println!("Signed out");
            Ok(())
        }
        Command::Watch { bucket } => watch(&simperium, &bucket).await,
        Command::Get { bucket, key } => {
            let bucket = synced_bucket(&simperium, &bucket, timeout).await?;
            match key {
                Some(key) => print_json(&Value::Object(bucket.get(&key)?.properties().clone())),
                None => {
                    let objects: Map<String, Value> = bucket
                        .all_objects()
                        .into_iter()
                        .map(|object| (object.key().to_string(), Value::Object(object.properties().clone())))
                        .collect();
                    print_json(&Value::Object(objects))
                }
            }
        }
        Command::Put { bucket, key, json } => {
            let properties = match serde_json::from_str(&json).context("Invalid JSON")? {
                Value::Object(properties) => properties,
                _ => bail!("Object data must be a JSON object"),
            };
            let bucket = synced_bucket(&simperium, &bucket, timeout).await?;
            let mut object = match bucket.get(&key) {
                Ok(object) => object,
                Err(_) => bucket.new_object_with_key(&key)?,
            };
            object.set_properties(properties);
            bucket.sync(&object)?;
            wait_until_idle(&bucket, timeout).await?;
            println!("Saved {}", key);
            Ok(())
        }
        Command::Delete { bucket, key } => {
            let bucket = synced_bucket(&simperium, &bucket, timeout).await?;
            bucket.remove(&bucket.get(&key)?)?;
            wait_until_idle(&bucket, timeout).await?;
            println!("Deleted {}", key);
            Ok(())
        }
        Command::Revisions { bucket, key, max } => {
            let bucket = synced_bucket(&simperium, &bucket, timeout).await?;
            let revisions = revisions(&bucket, &key, max, timeout).await?;
            let versions: Map<String, Value> = revisions
                .into_iter()
                .map(|(version, object)| (version.to_string(), Value::Object(object.properties().clone())))
                .collect();
            print_json(&Value::Object(versions))
        }
    }
}

async fn login(simperium: &Simperium, args: UserArgs, create: bool) -> anyhow::Result<()> {
    args.validate()?;
    let user = if create {
        simperium.create_user(&args.username, &args.password).await?
    } else {
        simperium.authorize_user(&args.username, &args.password).await?
    };
    println!("Signed in as {}", user.email().unwrap_or(args.username));
    Ok(())
}

fn require_user(simperium: &Simperium) -> anyhow::Result<()> {
    if simperium.needs_authorization() {
        bail!("Not signed in, run `simperium login` first");
    }
    Ok(())
}

async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

/// Starts the bucket and waits for a complete index
async fn synced_bucket(simperium: &Simperium, name: &str, timeout: Duration) -> anyhow::Result<Arc<Bucket>> {
    require_user(simperium)?;
    let bucket = simperium.bucket(name)?;
    bucket.start();

    let synced = wait_for(timeout, || {
        simperium.is_connected() && bucket.has_change_version() && bucket.is_idle()
    })
    .await;
    if !synced {
        bail!("Timed out syncing bucket {} ({})", name, simperium.connection_status());
    }
    info!("Bucket {} synced at {}", name, bucket.get_change_version());
    Ok(bucket)
}

async fn wait_until_idle(bucket: &Bucket, timeout: Duration) -> anyhow::Result<()> {
    if !wait_for(timeout, || bucket.is_idle()).await {
        bail!("Timed out waiting for the server to accept changes to {}", bucket.name());
    }
    Ok(())
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============== Watch ==============

struct ChangePrinter;

impl BucketListener for ChangePrinter {
    fn on_network_change(&self, bucket: &Bucket, change_type: ChangeType, key: Option<&str>) {
        let time = chrono::Local::now().format("%H:%M:%S%.3f");
        let Some(key) = key else {
            println!("[{}] {} {}", time, change_type, bucket.name());
            return;
        };
        match bucket.get(key) {
            Ok(object) if change_type != ChangeType::Remove => {
                let data = serde_json::to_string(object.properties()).unwrap_or_default();
                println!("[{}] {} {}.{} {}", time, change_type, key, object.version(), data);
            }
            _ => println!("[{}] {} {}", time, change_type, key),
        }
    }
}

async fn watch(simperium: &Simperium, name: &str) -> anyhow::Result<()> {
    require_user(simperium)?;
    let bucket = simperium.bucket(name)?;
    bucket.add_listener(Arc::new(ChangePrinter));
    bucket.start();
    info!("Watching bucket {}", name);

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, stopping");
    bucket.stop();
    Ok(())
}

// ============== Revisions ==============

type RevisionsResult = Result<BTreeMap<u64, BucketObject>, String>;

struct RevisionsReply {
    sender: Mutex<Option<oneshot::Sender<RevisionsResult>>>,
}

impl RevisionsReply {
    fn reply(&self, result: RevisionsResult) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(result);
        }
    }
}

impl RevisionsCallbacks for RevisionsReply {
    fn on_complete(&self, revisions: BTreeMap<u64, BucketObject>) {
        self.reply(Ok(revisions));
    }

    fn on_error(&self, error: ClientError) {
        self.reply(Err(error.to_string()));
    }
}

async fn revisions(
    bucket: &Bucket,
    key: &str,
    max: u64,
    timeout: Duration,
) -> anyhow::Result<BTreeMap<u64, BucketObject>> {
    let (sender, receiver) = oneshot::channel();
    let callbacks = Arc::new(RevisionsReply {
        sender: Mutex::new(Some(sender)),
    });
    bucket.get_revisions(key, max, callbacks)?;

    let result = tokio::time::timeout(timeout, receiver)
        .await
        .context("Timed out waiting for revisions")?
        .context("Revisions request dropped")?;
    result.map_err(anyhow::Error::msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revisions_reply_only_once() {
        let (sender, receiver) = oneshot::channel();
        let reply = RevisionsReply {
            sender: Mutex::new(Some(sender)),
        };
        reply.on_error(ClientError::NotConnected);
        reply.on_complete(BTreeMap::new());

        let result = receiver.await.unwrap();
        assert_eq!(result.unwrap_err(), "connection not ready");
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        assert!(!wait_for(Duration::from_millis(60), || false).await);
        assert!(wait_for(Duration::from_millis(60), || true).await);
    }
}
