#![allow(dead_code)]

use std::{future::Future, time::Duration};
use transform_streams::{
    PlatformFuture, StreamError, StreamResult, TransformStreamDefaultController, Transformer,
};

pub async fn run_local<F: Future>(fut: F) -> F::Output {
    tokio::task::LocalSet::new().run_until(fut).await
}

pub fn spawn_local(fut: PlatformFuture<'static, ()>) {
    tokio::task::spawn_local(fut);
}

/// Fails the test instead of hanging when `fut` never resolves.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), fut)
        .await
        .expect("operation timed out")
}

pub struct Doubler;

impl Transformer<i32, i32> for Doubler {
    async fn transform(
        &mut self,
        chunk: i32,
        controller: &mut TransformStreamDefaultController<i32>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk * 2)
    }
}

pub struct Uppercase;

impl Transformer<String, String> for Uppercase {
    async fn transform(
        &mut self,
        chunk: String,
        controller: &mut TransformStreamDefaultController<String>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk.to_uppercase())
    }
}

/// Rejects the chunk equal to `value` with `reason`.
pub struct FailOn {
    pub value: i32,
    pub reason: StreamError,
}

impl Transformer<i32, i32> for FailOn {
    async fn transform(
        &mut self,
        chunk: i32,
        controller: &mut TransformStreamDefaultController<i32>,
    ) -> StreamResult<()> {
        if chunk == self.value {
            return Err(self.reason.clone());
        }
        controller.enqueue(chunk)
    }
}

/// Terminates the stream when it sees a zero.
pub struct StopAtZero;

impl Transformer<i32, i32> for StopAtZero {
    async fn transform(
        &mut self,
        chunk: i32,
        controller: &mut TransformStreamDefaultController<i32>,
    ) -> StreamResult<()> {
        if chunk == 0 {
            controller.terminate()
        } else {
            controller.enqueue(chunk)
        }
    }
}

/// Emits a header chunk from `start` and a trailer from `flush`.
pub struct Framed;

impl Transformer<String, String> for Framed {
    async fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<String>,
    ) -> StreamResult<()> {
        controller.enqueue("<".to_string())
    }

    async fn transform(
        &mut self,
        chunk: String,
        controller: &mut TransformStreamDefaultController<String>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk)
    }

    async fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<String>,
    ) -> StreamResult<()> {
        controller.enqueue(">".to_string())
    }
}

pub struct FailingStart {
    pub reason: StreamError,
}

impl Transformer<i32, i32> for FailingStart {
    async fn start(
        &mut self,
        _controller: &mut TransformStreamDefaultController<i32>,
    ) -> StreamResult<()> {
        Err(self.reason.clone())
    }

    async fn transform(
        &mut self,
        chunk: i32,
        controller: &mut TransformStreamDefaultController<i32>,
    ) -> StreamResult<()> {
        controller.enqueue(chunk)
    }
}
