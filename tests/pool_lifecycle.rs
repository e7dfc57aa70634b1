//! Seed scenarios 1-6: pool admission, reuse, teardown-and-replace, and
//! shutdown, all driven against a fake launcher so no real Chrome binary is
//! required.

mod common;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use chrome_relay_proxy::browser::testing::FakeLauncher;
use chrome_relay_proxy::browser::BrowserPool;
use chrome_relay_proxy::config::ChromeOptions;
use chrome_relay_proxy::error::PoolError;

use common::{chrome_config, pool_config, wait_until};

/// Scenario 1: boot with MIN=1 and default options; pool length becomes 1.
#[tokio::test]
async fn boots_to_minimum_instances() {
    let pool = BrowserPool::new_with_launcher(
        pool_config(2, 1),
        chrome_config(true),
        Arc::new(FakeLauncher::new()),
    );
    pool.warm().await.unwrap();
    assert_eq!(pool.len().await, 1);
    assert!(pool.has_idle_chrome_instance().await);
}

/// Scenario 2: MAX=1,MIN=1. Release the bound instance via BrowserDestroyed;
/// within 2 seconds a replacement with a different debug URL appears.
#[tokio::test]
async fn destroyed_instance_is_replaced_below_floor() {
    let pool = BrowserPool::new_with_launcher(
        pool_config(1, 1),
        chrome_config(false),
        Arc::new(FakeLauncher::new()),
    );
    pool.warm().await.unwrap();

    let default_options = ChromeOptions::new("");
    let bound = pool
        .get_available_chrome(Uuid::new_v4(), default_options.clone(), None)
        .await
        .unwrap();
    let original_debug_url = bound.debug_url.clone();

    // reuse is disabled, so ending the session tears the instance down and
    // the reconciler replaces it because the pool sits below its floor.
    bound.set_idle_or_stop().await;

    wait_until(Duration::from_secs(2), || async { pool.len().await == 1 }).await;

    let replacement = pool
        .get_available_chrome(Uuid::new_v4(), default_options, None)
        .await
        .unwrap();
    assert_ne!(replacement.debug_url, original_debug_url);
}

/// Scenario 3: MAX=1,MIN=0. First request creates an instance; destroying it
/// leaves the pool empty (no floor to replace below); a second request
/// creates a fresh instance, whose destruction again empties the pool.
#[tokio::test]
async fn zero_floor_never_replaces_after_teardown() {
    let pool = BrowserPool::new_with_launcher(
        pool_config(1, 0),
        chrome_config(false),
        Arc::new(FakeLauncher::new()),
    );
    assert_eq!(pool.len().await, 0);

    let options = ChromeOptions::new("");
    let first = pool
        .get_available_chrome(Uuid::new_v4(), options.clone(), None)
        .await
        .unwrap();
    assert_eq!(pool.len().await, 1);

    first.set_idle_or_stop().await;
    wait_until(Duration::from_secs(2), || async { pool.len().await == 0 }).await;

    let second = pool
        .get_available_chrome(Uuid::new_v4(), options, None)
        .await
        .unwrap();
    assert_eq!(pool.len().await, 1);

    second.set_idle_or_stop().await;
    wait_until(Duration::from_secs(2), || async { pool.len().await == 0 }).await;
}

/// Scenario 4: MIN=2. Two distinct sessions each bind exactly one instance
/// and see that instance's own debug URL.
#[tokio::test]
async fn two_sessions_bind_two_distinct_instances() {
    let pool = BrowserPool::new_with_launcher(
        pool_config(2, 2),
        chrome_config(true),
        Arc::new(FakeLauncher::new()),
    );
    pool.warm().await.unwrap();

    let options = ChromeOptions::new("");
    let first = pool
        .get_available_chrome(Uuid::new_v4(), options.clone(), None)
        .await
        .unwrap();
    let second = pool
        .get_available_chrome(Uuid::new_v4(), options, None)
        .await
        .unwrap();

    assert_ne!(first.browser_id, second.browser_id);
    assert_ne!(first.debug_url, second.debug_url);
    assert_eq!(pool.len().await, 2);
}

/// Scenario 5: MIN=1,MAX=1. Consuming the one instance then requesting a
/// second session with the default hash returns NoneAvailable.
#[tokio::test]
async fn none_available_once_the_single_instance_is_consumed() {
    let pool = BrowserPool::new_with_launcher(
        pool_config(1, 1),
        chrome_config(true),
        Arc::new(FakeLauncher::new()),
    );
    pool.warm().await.unwrap();

    let options = ChromeOptions::new("");
    pool.get_available_chrome(Uuid::new_v4(), options.clone(), None)
        .await
        .unwrap();

    let err = pool
        .get_available_chrome(Uuid::new_v4(), options, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NoneAvailable));
}

/// Scenario 6: MIN=2,MAX=2. Shutting down the pool drains it to zero.
#[tokio::test]
async fn shutdown_drains_the_pool() {
    let pool = BrowserPool::new_with_launcher(
        pool_config(2, 2),
        chrome_config(true),
        Arc::new(FakeLauncher::new()),
    );
    pool.warm().await.unwrap();
    assert_eq!(pool.len().await, 2);

    pool.shutdown().await;
    assert_eq!(pool.len().await, 0);
}
