//! Stopping pooled resources when the lifecycle authority misbehaves.

use std::sync::Arc;

use mockall::mock;
use nebula_pool::config::PoolConfig;
use nebula_pool::context::LifecycleAuthority;
use nebula_pool::endpoint::Producer;
use nebula_pool::error::{Error, Result};
use nebula_pool::lifecycle::{Service, stop_and_deregister};
use nebula_pool::pool::ServicePool;
use nebula_pool::testing::{MockEndpoint, MockService};

mock! {
    pub Authority {}

    impl LifecycleAuthority for Authority {
        fn add_service(&self, service: Arc<dyn Service>, autostart: bool, enlist: bool) -> Result<()>;
        fn remove_service(&self, service: &Arc<dyn Service>) -> Result<bool>;
    }
}

fn init_tracing() {
    // already installed by another test in this binary
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn starting_authority() -> MockAuthority {
    let mut authority = MockAuthority::new();
    authority
        .expect_add_service()
        .returning(|service, autostart, _enlist| {
            if autostart {
                service.start()?;
            }
            Ok(())
        });
    authority
}

#[test]
fn failed_deregistration_still_stops_the_service() {
    init_tracing();
    let mut authority = MockAuthority::new();
    authority
        .expect_remove_service()
        .times(1)
        .returning(|_| Err(Error::internal("registry unavailable")));

    let service = Arc::new(MockService::default());
    service.start().unwrap();
    stop_and_deregister(Arc::clone(&service) as Arc<dyn Service>, &authority);

    assert!(service.is_stopped());
    assert_eq!(service.stops(), 1);
}

#[test]
fn never_started_service_is_still_deregistered() {
    let mut authority = MockAuthority::new();
    authority
        .expect_remove_service()
        .times(1)
        .returning(|_| Ok(true));

    let service = Arc::new(MockService::failing_start());
    stop_and_deregister(service as Arc<dyn Service>, &authority);
}

#[test]
fn pool_shutdown_survives_deregistration_failures() {
    init_tracing();
    let mut authority = starting_authority();
    authority
        .expect_remove_service()
        .returning(|_| Err(Error::internal("registry unavailable")));
    let authority = Arc::new(authority);

    let shared = MockEndpoint::builder("mock:shared", &authority).build();
    let exclusive = MockEndpoint::builder("mock:exclusive", &authority)
        .singleton(false)
        .build();
    let pool: ServicePool<dyn Producer> = ServicePool::new(4, PoolConfig::default());
    pool.start().unwrap();

    for endpoint in [&shared, &exclusive] {
        let handle = endpoint.as_endpoint();
        let producer = pool.acquire(&handle).unwrap().unwrap();
        pool.release(&handle, producer);
    }
    assert_eq!(pool.size(), 2);

    pool.stop().unwrap();
    assert_eq!(pool.size(), 0);
    assert_eq!(shared.stops().get(), 1);
    assert_eq!(exclusive.stops().get(), 1);
}

#[test]
fn creation_registers_with_the_endpoint_authority() {
    let mut authority = MockAuthority::new();
    authority
        .expect_add_service()
        .withf(|_, autostart, _| *autostart)
        .times(1)
        .returning(|service, _, _| service.start());
    authority.expect_remove_service().returning(|_| Ok(true));
    let authority = Arc::new(authority);

    let endpoint = MockEndpoint::builder("mock:a", &authority).build();
    let pool: ServicePool<dyn Producer> = ServicePool::new(4, PoolConfig::default());
    pool.start().unwrap();

    let handle = endpoint.as_endpoint();
    let first = pool.acquire(&handle).unwrap().unwrap();
    let second = pool.acquire(&handle).unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(first.is_started());
    pool.stop().unwrap();
}
