//! Simperium Live Tests
//!
//! These tests talk to the real Simperium service.
//!
//! To run these tests:
//! 1. Export SIMPERIUM_APP_ID, SIMPERIUM_APP_SECRET, SIMPERIUM_USERNAME and
//!    SIMPERIUM_PASSWORD for a test app
//! 2. Run: cargo test -p simperium-client --test live_test -- --ignored

use std::time::Duration;

use simperium_client::{Simperium, SimperiumConfig};

fn env(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} must be set"))
}

fn create_config() -> SimperiumConfig {
    SimperiumConfig::new(&env("SIMPERIUM_APP_ID"), &env("SIMPERIUM_APP_SECRET"))
}

async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition()
}

// ============== Auth Tests ==============

#[tokio::test]
#[ignore]
async fn test_live_authorize() -> anyhow::Result<()> {
    let simperium = Simperium::new(create_config())?;
    let user = simperium
        .authorize_user(&env("SIMPERIUM_USERNAME"), &env("SIMPERIUM_PASSWORD"))
        .await?;

    println!("✓ Authorized {:?}", user.email());
    assert!(user.has_access_token());
    Ok(())
}

// ============== Sync Tests ==============

#[tokio::test]
#[ignore]
async fn test_live_sync_object() -> anyhow::Result<()> {
    let simperium = Simperium::new(create_config())?;
    simperium
        .authorize_user(&env("SIMPERIUM_USERNAME"), &env("SIMPERIUM_PASSWORD"))
        .await?;

    let bucket = simperium.bucket("rust-live-test")?;
    bucket.start();
    assert!(wait_for(Duration::from_secs(30), || bucket.has_change_version()).await);
    println!("✓ Indexed {} objects", bucket.all_objects().len());

    let mut object = bucket.new_object()?;
    object.set("title", "live test")?;
    bucket.sync(&object)?;

    let key = object.key().to_string();
    assert!(wait_for(Duration::from_secs(30), || bucket.get_key_version(&key).is_ok_and(|v| v > 0)).await);
    println!("✓ Object {} acknowledged", key);

    bucket.remove(&bucket.get(&key)?)?;
    assert!(wait_for(Duration::from_secs(30), || !bucket.contains_key(&key)).await);
    bucket.stop();
    Ok(())
}
