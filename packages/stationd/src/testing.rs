//! Fakes shared by the daemon's unit tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use stationd_interface::{OrderContext, Parameter, ProgramRequest, ProgramSpec};

use crate::remote::{RemoteService, ServiceError};

pub fn order() -> OrderContext {
    OrderContext {
        order_no: "ORD-1".to_string(),
        nc12: "929000000001".to_string(),
        quantity: 1,
        line: None,
    }
}

pub fn request(units: &[&str]) -> ProgramRequest {
    ProgramRequest {
        order: order(),
        program: ProgramSpec {
            name: "default".to_string(),
            parameters: vec![
                Parameter { id: 1, value: 350 },
                Parameter { id: 2, value: 4200 },
            ],
        },
        units: units.iter().map(|u| u.to_string()).collect(),
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Match(String),
    Fail(String),
    Never,
}

/// Scripted [`RemoteService`].
#[derive(Debug, Clone)]
pub struct FakeRemote {
    service_tag: Result<String, String>,
    reply: Reply,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl FakeRemote {
    fn with_reply(reply: Reply) -> Self {
        Self {
            service_tag: Ok("ST-0001".to_string()),
            reply,
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    pub fn matching(identifier: &str) -> Self {
        Self::with_reply(Reply::Match(identifier.to_string()))
    }

    pub fn failing(code: &str) -> Self {
        Self::with_reply(Reply::Fail(code.to_string()))
    }

    /// Never answers a check.
    pub fn silent() -> Self {
        Self::with_reply(Reply::Never)
    }

    pub fn delayed(identifier: &str, delay: Duration) -> Self {
        Self {
            delay,
            ..Self::matching(identifier)
        }
    }

    pub fn without_service_tag(code: &str) -> Self {
        Self {
            service_tag: Err(code.to_string()),
            ..Self::matching("")
        }
    }

    /// Number of `verify_scan` calls made so far.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl RemoteService for FakeRemote {
    async fn issue_service_tag(&self, _order: &OrderContext) -> Result<String, ServiceError> {
        self.service_tag.clone().map_err(ServiceError::new)
    }

    async fn verify_scan(&self, _order: &OrderContext, _scan: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.reply {
            Reply::Match(identifier) => Ok(identifier.clone()),
            Reply::Fail(code) => Err(ServiceError::new(code.clone())),
            Reply::Never => std::future::pending().await,
        }
    }
}
