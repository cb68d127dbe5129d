use super::{
    CountQueuingStrategy, QueuingStrategy, StreamResult,
    backpressure::{Backpressure, BackpressureChange},
    error::StreamError,
    readable::{ReadableSource, ReadableState, ReadableStream, ReadableStreamDefaultController},
    writable::{WritableSink, WritableState, WritableStream, WritableStreamDefaultController},
};
use crate::platform::{
    BoxedStrategy, MaybeSend, MaybeSync, PlatformBoxFuture, PlatformFuture, SharedPtr, SharedWeak,
};
use futures::{
    future::{self, FutureExt, Shared},
    lock::Mutex as AsyncMutex,
};
use parking_lot::Mutex;
use std::{future::Future, marker::PhantomData};

/// User-supplied transformation logic.
///
/// `transform` is never invoked while a previous `transform` or `flush` is
/// still pending, and never before `start` has resolved.
pub trait Transformer<I: MaybeSend + 'static, O: MaybeSend + 'static>: MaybeSend + 'static {
    /// Called once when the transform stream is created
    fn start(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called for each chunk written to the writable side
    fn transform(
        &mut self,
        chunk: I,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Called when the writable side is closed
    fn flush(
        &mut self,
        controller: &mut TransformStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }
}

/// Passes every chunk through unchanged.
pub struct IdentityTransformer<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> IdentityTransformer<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for IdentityTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: MaybeSend + 'static> Transformer<T, T> for IdentityTransformer<T> {
    fn transform(
        &mut self,
        chunk: T,
        controller: &mut TransformStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(controller.enqueue(chunk))
    }
}

// ----------- Algorithms -----------
trait TransformFn<I>:
    Fn(I) -> PlatformBoxFuture<'static, StreamResult<()>> + MaybeSend + MaybeSync
{
}
impl<I, F> TransformFn<I> for F where
    F: Fn(I) -> PlatformBoxFuture<'static, StreamResult<()>> + MaybeSend + MaybeSync
{
}

trait FlushFn: FnOnce() -> PlatformBoxFuture<'static, StreamResult<()>> + MaybeSend {}
impl<F> FlushFn for F where F: FnOnce() -> PlatformBoxFuture<'static, StreamResult<()>> + MaybeSend {}

struct TransformAlgorithms<I> {
    transform: SharedPtr<dyn TransformFn<I>>,
    flush: Option<Box<dyn FlushFn>>,
}

type StartFuture = Shared<PlatformBoxFuture<'static, StreamResult<()>>>;

// ----------- Coordinator -----------
struct CoordinatorState<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    backpressure: Option<Backpressure>,
    algorithms: Option<TransformAlgorithms<I>>,
    controller: Option<TransformStreamDefaultController<O>>,
    /// Set once the stream reached a terminal transition; later error or
    /// terminate requests are ignored.
    terminated: bool,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> CoordinatorState<I, O> {
    fn backpressure(&self) -> bool {
        self.backpressure.as_ref().is_some_and(Backpressure::applied)
    }

    fn set_backpressure(&mut self, applied: bool) -> &Backpressure {
        log::trace!("transform stream backpressure: {applied}");
        // An uninitialized flag accepts either value.
        let backpressure = self
            .backpressure
            .get_or_insert_with(|| Backpressure::new(!applied));
        backpressure.set(applied);
        backpressure
    }

    fn clear_algorithms(&mut self) {
        self.algorithms = None;
    }
}

/// Shared state linking the two endpoints of one transform stream.
///
/// The endpoint drivers hold strong references; the user controller holds
/// a weak one. No lock is held while user code runs.
pub(crate) struct TransformStreamCore<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    readable: ReadableStreamDefaultController<O>,
    writable: WritableStreamDefaultController<I>,
    state: Mutex<CoordinatorState<I, O>>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStreamCore<I, O> {
    /// Links the endpoints and applies initial backpressure.
    fn new(
        readable: ReadableStreamDefaultController<O>,
        writable: WritableStreamDefaultController<I>,
    ) -> Self {
        let mut state = CoordinatorState {
            backpressure: None,
            algorithms: None,
            controller: None,
            terminated: false,
        };
        state.set_backpressure(true);
        Self {
            readable,
            writable,
            state: Mutex::new(state),
        }
    }

    fn set_up_controller(
        &self,
        controller: TransformStreamDefaultController<O>,
        algorithms: TransformAlgorithms<I>,
    ) {
        let mut state = self.state.lock();
        assert!(
            state.controller.is_none(),
            "transform stream controller is already set up"
        );
        state.controller = Some(controller);
        state.algorithms = Some(algorithms);
    }

    pub(crate) fn backpressure(&self) -> bool {
        self.state.lock().backpressure()
    }

    #[cfg(test)]
    fn controller(&self) -> Option<TransformStreamDefaultController<O>> {
        self.state.lock().controller.clone()
    }

    fn error(&self, reason: StreamError) {
        let mut state = self.state.lock();
        if state.terminated {
            log::trace!("ignoring error on terminated transform stream: {reason}");
            return;
        }
        log::debug!("transform stream errored: {reason}");
        self.readable.error(reason.clone());
        self.error_writable_and_unblock_write(&mut state, reason);
    }

    fn error_writable_and_unblock_write(
        &self,
        state: &mut CoordinatorState<I, O>,
        reason: StreamError,
    ) {
        if state.terminated {
            return;
        }
        state.terminated = true;
        state.clear_algorithms();
        self.writable.error_if_needed(reason);
        if state.backpressure() {
            state.set_backpressure(false);
        }
    }

    fn enqueue(&self, chunk: O) -> StreamResult<()> {
        if !self.readable.can_close_or_enqueue() {
            return Err(StreamError::TypeError(
                "readable side is not in a state that permits enqueue".into(),
            ));
        }

        // The readable size function is user code; it runs unlocked.
        let enqueued = self.readable.enqueue(chunk);
        let mut state = self.state.lock();
        if let Err(error) = enqueued {
            self.error_writable_and_unblock_write(&mut state, error.clone());
            return Err(self.readable.stored_error().unwrap_or(error));
        }

        // Enqueue can only raise backpressure. A pull that is already
        // scheduled releases it.
        let backpressure = !self.readable.should_call_pull();
        if backpressure && !state.backpressure() {
            state.set_backpressure(true);
        }
        Ok(())
    }

    fn terminate(&self) {
        let mut state = self.state.lock();
        if state.terminated {
            return;
        }
        log::debug!("transform stream terminated");
        if self.readable.can_close_or_enqueue() {
            let _ = self.readable.close();
        }
        self.error_writable_and_unblock_write(&mut state, StreamError::Terminated);
    }

    fn desired_size(&self) -> Option<isize> {
        self.readable.desired_size()
    }

    async fn perform_transform(&self, chunk: I) -> StreamResult<()> {
        let transform = self
            .state
            .lock()
            .algorithms
            .as_ref()
            .map(|algorithms| SharedPtr::clone(&algorithms.transform));
        let Some(transform) = transform else {
            return Err(self.writable.stored_error().unwrap_or_else(|| {
                StreamError::TypeError("transform algorithm has been cleared".into())
            }));
        };

        match transform(chunk).await {
            Ok(()) => Ok(()),
            Err(reason) => {
                self.error(reason.clone());
                Err(reason)
            }
        }
    }

    async fn sink_write(&self, chunk: I) -> StreamResult<()> {
        let change = {
            let state = self.state.lock();
            match &state.backpressure {
                Some(backpressure) if backpressure.applied() => Some(backpressure.change()),
                _ => None,
            }
        };

        if let Some(change) = change {
            log::trace!("transform write waiting for backpressure to change");
            change.await.map_err(|_| StreamError::TaskDropped)?;
            if self.writable.state() == WritableState::Erroring {
                return Err(self
                    .writable
                    .stored_error()
                    .unwrap_or(StreamError::TaskDropped));
            }
        }

        self.perform_transform(chunk).await
    }

    fn sink_abort(&self, reason: Option<String>) {
        self.error(StreamError::Aborted(reason));
    }

    async fn sink_close(&self) -> StreamResult<()> {
        let flush = {
            let mut state = self.state.lock();
            let flush = state
                .algorithms
                .as_mut()
                .and_then(|algorithms| algorithms.flush.take());
            state.clear_algorithms();
            flush
        };
        let flushing = flush.map(|flush| flush());

        // Algorithms cleared by an earlier terminal transition leave
        // nothing to flush.
        let result = match flushing {
            Some(flushing) => flushing.await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                if self.readable.state() == ReadableState::Errored {
                    return Err(self
                        .readable
                        .stored_error()
                        .unwrap_or(StreamError::TaskDropped));
                }
                if self.readable.can_close_or_enqueue() {
                    let _ = self.readable.close();
                }
                self.state.lock().terminated = true;
                log::trace!("transform stream flushed and closed");
                Ok(())
            }
            Err(reason) => {
                self.error(reason.clone());
                Err(self.readable.stored_error().unwrap_or(reason))
            }
        }
    }

    fn source_pull(&self) -> BackpressureChange {
        let mut state = self.state.lock();
        assert!(
            state.backpressure(),
            "transform stream pulled while backpressure is released"
        );
        state.set_backpressure(false).change()
    }

    fn source_cancel(&self, reason: Option<String>) {
        log::debug!("transform stream readable side canceled: {reason:?}");
        let mut state = self.state.lock();
        self.error_writable_and_unblock_write(&mut state, StreamError::Canceled(reason));
    }
}

/// Controller operations reachable from user code without naming the input
/// type.
trait ControllerTarget<O>: MaybeSend + MaybeSync {
    fn enqueue_chunk(&self, chunk: O) -> StreamResult<()>;
    fn error_stream(&self, reason: StreamError);
    fn terminate_stream(&self);
    fn readable_desired_size(&self) -> Option<isize>;
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> ControllerTarget<O>
    for TransformStreamCore<I, O>
{
    fn enqueue_chunk(&self, chunk: O) -> StreamResult<()> {
        self.enqueue(chunk)
    }

    fn error_stream(&self, reason: StreamError) {
        self.error(reason);
    }

    fn terminate_stream(&self) {
        self.terminate();
    }

    fn readable_desired_size(&self) -> Option<isize> {
        self.desired_size()
    }
}

// ----------- Controller -----------
/// Handle given to the [`Transformer`] for producing output and ending the
/// stream.
pub struct TransformStreamDefaultController<O: MaybeSend + 'static> {
    stream: SharedWeak<dyn ControllerTarget<O>>,
}

impl<O: MaybeSend + 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            stream: SharedWeak::clone(&self.stream),
        }
    }
}

impl<O: MaybeSend + 'static> TransformStreamDefaultController<O> {
    fn new(stream: SharedWeak<dyn ControllerTarget<O>>) -> Self {
        Self { stream }
    }

    fn target(&self) -> StreamResult<SharedPtr<dyn ControllerTarget<O>>> {
        self.stream.upgrade().ok_or(StreamError::TaskDropped)
    }

    /// Enqueue to readable side
    ///
    /// Fails with a [`StreamError::TypeError`] once the readable side is
    /// closing, closed or errored.
    pub fn enqueue(&self, chunk: O) -> StreamResult<()> {
        self.target()?.enqueue_chunk(chunk)
    }

    /// Errors both the readable and writable side of the transform stream
    pub fn error(&self, error: StreamError) -> StreamResult<()> {
        self.target()?.error_stream(error);
        Ok(())
    }

    /// Closes the readable side and errors the writable side of the stream
    pub fn terminate(&self) -> StreamResult<()> {
        self.target()?.terminate_stream();
        Ok(())
    }

    /// Get desired size to fill the readable side of the stream's internal queue
    pub fn desired_size(&self) -> Option<isize> {
        self.stream
            .upgrade()
            .and_then(|stream| stream.readable_desired_size())
    }
}

// ----------- Endpoint adapters -----------
/// Readable source feeding the transform stream's output side.
pub struct TransformSource<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    stream: SharedPtr<TransformStreamCore<I, O>>,
    start: StartFuture,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> ReadableSource<O> for TransformSource<I, O> {
    fn start(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.start.clone()
    }

    fn pull(
        &mut self,
        _controller: &mut ReadableStreamDefaultController<O>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let change = self.stream.source_pull();
        change.map(|result| result.map_err(|_| StreamError::TaskDropped))
    }

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.stream.source_cancel(reason);
        future::ready(Ok(()))
    }
}

/// Writable sink feeding chunks into the transformer.
pub struct TransformSink<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    stream: SharedPtr<TransformStreamCore<I, O>>,
    start: StartFuture,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> WritableSink<I> for TransformSink<I, O> {
    fn start(
        &mut self,
        _controller: &mut WritableStreamDefaultController<I>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.start.clone()
    }

    fn write(
        &mut self,
        chunk: I,
        _controller: &mut WritableStreamDefaultController<I>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let stream = SharedPtr::clone(&self.stream);
        async move { stream.sink_write(chunk).await }
    }

    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        async move { self.stream.sink_close().await }
    }

    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        self.stream.sink_abort(reason);
        future::ready(Ok(()))
    }
}

// ----------- TransformStream -----------
/// A writable side and a readable side joined by a [`Transformer`].
pub struct TransformStream<I: MaybeSend + 'static, O: MaybeSend + 'static> {
    readable: ReadableStream<O, TransformSource<I, O>>,
    writable: WritableStream<I, TransformSink<I, O>>,
    core: SharedPtr<TransformStreamCore<I, O>>,
}

impl<I: MaybeSend + 'static, O: MaybeSend + 'static> TransformStream<I, O> {
    /// Returns a builder for this transform stream
    pub fn builder<T>(transformer: T) -> TransformStreamBuilder<I, O, T>
    where
        T: Transformer<I, O>,
    {
        TransformStreamBuilder::new(transformer)
    }

    /// Get the readable side
    pub fn readable(self) -> ReadableStream<O, TransformSource<I, O>> {
        self.readable
    }

    /// Get the writable side
    pub fn writable(self) -> WritableStream<I, TransformSink<I, O>> {
        self.writable
    }

    /// Split into both sides
    pub fn split(
        self,
    ) -> (
        ReadableStream<O, TransformSource<I, O>>,
        WritableStream<I, TransformSink<I, O>>,
    ) {
        (self.readable, self.writable)
    }

    /// Whether writes are currently held back until the readable side pulls.
    pub fn backpressure(&self) -> bool {
        self.core.backpressure()
    }
}

impl<T: MaybeSend + 'static> TransformStream<T, T> {
    /// Builder for a stream that forwards chunks unchanged.
    ///
    /// ```rust
    /// use transform_streams::TransformStream;
    ///
    /// let (stream, _driver) = TransformStream::<String, String>::identity().prepare();
    /// let (readable, writable) = stream.split();
    /// assert!(!readable.locked());
    /// assert!(!writable.locked());
    /// ```
    pub fn identity() -> TransformStreamBuilder<T, T, IdentityTransformer<T>> {
        TransformStreamBuilder::new(IdentityTransformer::new())
    }
}

// ----------- Builder Pattern Implementation -----------
pub struct TransformStreamBuilder<I: MaybeSend + 'static, O: MaybeSend + 'static, T> {
    transformer: T,
    writable_strategy: BoxedStrategy<I>,
    readable_strategy: BoxedStrategy<O>,
}

impl<I, O, T> TransformStreamBuilder<I, O, T>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    fn new(transformer: T) -> Self {
        Self {
            transformer,
            writable_strategy: Box::new(CountQueuingStrategy::new(1)),
            readable_strategy: Box::new(CountQueuingStrategy::new(0)),
        }
    }

    pub fn writable_strategy<S: QueuingStrategy<I> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.writable_strategy = Box::new(s);
        self
    }

    pub fn readable_strategy<S: QueuingStrategy<O> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.readable_strategy = Box::new(s);
        self
    }

    /// Return stream + future without spawning. The future drives both
    /// sides and completes once both have closed or errored.
    pub fn prepare(self) -> (TransformStream<I, O>, impl Future<Output = ()>) {
        let readable_controller = ReadableStreamDefaultController::new(self.readable_strategy);
        let writable_controller = WritableStreamDefaultController::new(self.writable_strategy);
        let core = SharedPtr::new(TransformStreamCore::new(
            readable_controller.clone(),
            writable_controller.clone(),
        ));

        let weak = SharedPtr::downgrade(&core);
        let target: SharedWeak<dyn ControllerTarget<O>> = weak;
        let controller = TransformStreamDefaultController::new(target);
        let transformer = SharedPtr::new(AsyncMutex::new(self.transformer));
        core.set_up_controller(
            controller.clone(),
            transform_algorithms(&transformer, &controller),
        );
        let start = start_algorithm::<I, O, T>(transformer, controller);

        let (readable, readable_task) = ReadableStream::from_controller(
            readable_controller,
            TransformSource {
                stream: SharedPtr::clone(&core),
                start: start.clone(),
            },
        );
        let (writable, writable_task) = WritableStream::from_controller(
            writable_controller,
            TransformSink {
                stream: SharedPtr::clone(&core),
                start,
            },
        );

        let stream = TransformStream {
            readable,
            writable,
            core,
        };
        (stream, transform_stream_task(readable_task, writable_task))
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> TransformStream<I, O>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> TransformStream<I, O>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

fn start_algorithm<I, O, T>(
    transformer: SharedPtr<AsyncMutex<T>>,
    mut controller: TransformStreamDefaultController<O>,
) -> StartFuture
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    let start: PlatformBoxFuture<'static, StreamResult<()>> =
        Box::pin(async move { transformer.lock().await.start(&mut controller).await });
    start.shared()
}

fn transform_algorithms<I, O, T>(
    transformer: &SharedPtr<AsyncMutex<T>>,
    controller: &TransformStreamDefaultController<O>,
) -> TransformAlgorithms<I>
where
    I: MaybeSend + 'static,
    O: MaybeSend + 'static,
    T: Transformer<I, O>,
{
    let transform = {
        let transformer = SharedPtr::clone(transformer);
        let controller = controller.clone();
        move |chunk: I| -> PlatformBoxFuture<'static, StreamResult<()>> {
            let transformer = SharedPtr::clone(&transformer);
            let mut controller = controller.clone();
            Box::pin(async move {
                transformer
                    .lock()
                    .await
                    .transform(chunk, &mut controller)
                    .await
            })
        }
    };

    let flush = {
        let transformer = SharedPtr::clone(transformer);
        let mut controller = controller.clone();
        move || -> PlatformBoxFuture<'static, StreamResult<()>> {
            Box::pin(async move { transformer.lock().await.flush(&mut controller).await })
        }
    };

    TransformAlgorithms {
        transform: SharedPtr::new(transform),
        flush: Some(Box::new(flush)),
    }
}

async fn transform_stream_task(
    readable_task: impl Future<Output = ()>,
    writable_task: impl Future<Output = ()>,
) {
    future::join(readable_task, writable_task).await;
    log::trace!("transform stream task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::test_util::{run_local, spawn_local_fn};
    use crate::streams::SizeQueuingStrategy;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    struct UppercaseTransformer;

    impl Transformer<String, String> for UppercaseTransformer {
        fn transform(
            &mut self,
            chunk: String,
            controller: &mut TransformStreamDefaultController<String>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            future::ready(controller.enqueue(chunk.to_uppercase()))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingTransformer {
        seen: SharedPtr<Mutex<Vec<i32>>>,
    }

    impl Transformer<i32, i32> for RecordingTransformer {
        fn transform(
            &mut self,
            chunk: i32,
            controller: &mut TransformStreamDefaultController<i32>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            self.seen.lock().push(chunk);
            future::ready(controller.enqueue(chunk))
        }
    }

    struct FailingFlush {
        reason: StreamError,
    }

    impl Transformer<i32, i32> for FailingFlush {
        fn transform(
            &mut self,
            chunk: i32,
            controller: &mut TransformStreamDefaultController<i32>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            future::ready(controller.enqueue(chunk))
        }

        fn flush(
            &mut self,
            _controller: &mut TransformStreamDefaultController<i32>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            future::ready(Err(self.reason.clone()))
        }
    }

    struct ErrorDuringFlush {
        reason: StreamError,
    }

    impl Transformer<i32, i32> for ErrorDuringFlush {
        fn transform(
            &mut self,
            chunk: i32,
            controller: &mut TransformStreamDefaultController<i32>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            future::ready(controller.enqueue(chunk))
        }

        fn flush(
            &mut self,
            controller: &mut TransformStreamDefaultController<i32>,
        ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
            future::ready(controller.error(self.reason.clone()))
        }
    }

    async fn settle_tasks() {
        sleep(Duration::from_millis(20)).await;
    }

    fn controller_of<I: MaybeSend + 'static, O: MaybeSend + 'static>(
        stream: &TransformStream<I, O>,
    ) -> TransformStreamDefaultController<O> {
        stream.core.controller().unwrap()
    }

    #[test]
    fn backpressure_is_applied_after_construction() {
        let (stream, _driver) = TransformStream::<i32, i32>::identity().prepare();
        assert!(stream.backpressure());
        assert!(stream.core.controller().is_some());
    }

    #[test]
    #[should_panic(expected = "already set up")]
    fn controller_is_set_up_once() {
        let (stream, _driver) = TransformStream::<i32, i32>::identity().prepare();
        let controller = controller_of(&stream);
        let transformer = SharedPtr::new(AsyncMutex::new(IdentityTransformer::<i32>::new()));
        let algorithms = transform_algorithms(&transformer, &controller);
        stream.core.set_up_controller(controller, algorithms);
    }

    #[test]
    #[should_panic(expected = "pulled while backpressure is released")]
    fn pull_without_backpressure_is_an_assertion_failure() {
        let (stream, _driver) = TransformStream::<i32, i32>::identity().prepare();
        let _ = stream.core.source_pull();
        let _ = stream.core.source_pull();
    }

    #[test]
    fn pull_releases_backpressure_and_resolves_previous_change() {
        let (stream, _driver) = TransformStream::<i32, i32>::identity().prepare();
        let before = {
            let state = stream.core.state.lock();
            state.backpressure.as_ref().map(Backpressure::change).unwrap()
        };

        let after = stream.core.source_pull();
        assert!(!stream.backpressure());
        assert_eq!(before.now_or_never(), Some(Ok(())));
        assert!(after.now_or_never().is_none());
    }

    #[tokio::test]
    async fn enqueue_without_demand_raises_backpressure_until_next_read() {
        run_local(async {
            let stream = TransformStream::<i32, i32>::identity().spawn(spawn_local_fn);
            let controller = controller_of(&stream);
            let core = SharedPtr::clone(&stream.core);
            let (readable, _writable) = stream.split();
            let (_, reader) = readable.get_reader().unwrap();
            assert!(core.backpressure());

            let first = reader.read();
            settle_tasks().await;
            assert!(!core.backpressure());

            // The chunk satisfies the waiting read; with a high-water mark of
            // zero nothing else is wanted.
            controller.enqueue(7).unwrap();
            assert!(core.backpressure());
            assert_eq!(first.await, Ok(Some(7)));

            let _second = reader.read();
            settle_tasks().await;
            assert!(!core.backpressure());
        })
        .await;
    }

    #[test]
    fn enqueue_on_closed_readable_fails_without_touching_backpressure() {
        let (stream, _driver) = TransformStream::<i32, i32>::identity().prepare();
        let controller = controller_of(&stream);
        let _ = stream.core.source_pull();
        stream.core.readable.close().unwrap();

        assert!(matches!(
            controller.enqueue(1),
            Err(StreamError::TypeError(_))
        ));
        assert!(!stream.backpressure());
    }

    #[test]
    fn failing_readable_size_errors_both_sides() {
        let (stream, _driver) = TransformStream::<i32, i32>::identity()
            .readable_strategy(SizeQueuingStrategy::new(
                0,
                |_: &i32| -> StreamResult<usize> { Err(StreamError::TypeError("unsized".into())) },
            ))
            .prepare();
        let controller = controller_of(&stream);

        let error = controller.enqueue(1).unwrap_err();
        assert_eq!(error, StreamError::TypeError("unsized".into()));
        assert_eq!(stream.core.readable.state(), ReadableState::Errored);
        assert_eq!(stream.core.writable.stored_error(), Some(error));
        assert!(!stream.backpressure());
    }

    #[test]
    fn readable_size_function_can_query_the_controller() {
        let slot: SharedPtr<Mutex<Option<TransformStreamDefaultController<i32>>>> =
            SharedPtr::default();
        let seen = SharedPtr::clone(&slot);
        let (stream, _driver) = TransformStream::<i32, i32>::identity()
            .readable_strategy(SizeQueuingStrategy::new(
                4,
                move |_: &i32| -> StreamResult<usize> {
                    let desired = seen.lock().as_ref().and_then(|c| c.desired_size());
                    Ok(desired.map_or(0, |size| size as usize / 2))
                },
            ))
            .prepare();
        let controller = controller_of(&stream);
        *slot.lock() = Some(controller.clone());

        controller.enqueue(1).unwrap();
        assert_eq!(controller.desired_size(), Some(2));
        assert!(stream.backpressure());
    }

    #[test]
    fn terminate_on_closed_readable_still_errors_writable() {
        let (stream, _driver) = TransformStream::<i32, i32>::identity().prepare();
        let controller = controller_of(&stream);
        stream.core.readable.close().unwrap();

        controller.terminate().unwrap();
        assert_eq!(
            stream.core.writable.stored_error(),
            Some(StreamError::Terminated)
        );
        assert!(!stream.backpressure());
    }

    #[test]
    fn second_error_is_ignored() {
        let (stream, _driver) = TransformStream::<i32, i32>::identity().prepare();
        let controller = controller_of(&stream);
        let first: StreamError = "first".into();

        controller.error(first.clone()).unwrap();
        controller.error("second".into()).unwrap();
        controller.terminate().unwrap();

        assert_eq!(stream.core.readable.stored_error(), Some(first.clone()));
        assert_eq!(stream.core.writable.stored_error(), Some(first));
    }

    #[test]
    fn controller_outliving_stream_reports_dropped_task() {
        let (stream, driver) = TransformStream::<i32, i32>::identity().prepare();
        let controller = controller_of(&stream);
        drop(driver);
        drop(stream);

        assert_eq!(controller.enqueue(1), Err(StreamError::TaskDropped));
        assert_eq!(controller.desired_size(), None);
    }

    #[tokio::test]
    async fn write_waits_for_pull_before_transforming() {
        run_local(async {
            let transformer = RecordingTransformer::default();
            let seen = SharedPtr::clone(&transformer.seen);
            let (readable, writable) = TransformStream::builder(transformer)
                .spawn(spawn_local_fn)
                .split();
            let (_, writer) = writable.get_writer().unwrap();
            let (_, reader) = readable.get_reader().unwrap();

            let write = writer.write(1);
            settle_tasks().await;
            assert!(seen.lock().is_empty());

            let chunk = timeout(Duration::from_secs(1), reader.read())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(chunk, Some(1));
            assert_eq!(*seen.lock(), vec![1]);
            assert_eq!(write.await, Ok(()));
        })
        .await;
    }

    #[tokio::test]
    async fn error_unblocks_pending_write_with_reason() {
        run_local(async {
            let stream = TransformStream::builder(RecordingTransformer::default())
                .spawn(spawn_local_fn);
            let controller = controller_of(&stream);
            let (readable, writable) = stream.split();
            let (_, writer) = writable.get_writer().unwrap();
            let (_, reader) = readable.get_reader().unwrap();

            let write = writer.write(1);
            settle_tasks().await;

            let reason: StreamError = "stop".into();
            controller.error(reason.clone()).unwrap();

            let result = timeout(Duration::from_secs(1), write).await.unwrap();
            assert_eq!(result, Err(reason.clone()));
            assert_eq!(reader.read().await, Err(reason));
        })
        .await;
    }

    #[tokio::test]
    async fn flush_failure_rejects_close_and_errors_readable() {
        run_local(async {
            let reason: StreamError = "flush failed".into();
            let (readable, writable) = TransformStream::builder(FailingFlush {
                reason: reason.clone(),
            })
            .spawn(spawn_local_fn)
            .split();
            let (_, writer) = writable.get_writer().unwrap();
            let (_, reader) = readable.get_reader().unwrap();

            let closed = timeout(Duration::from_secs(1), writer.close())
                .await
                .unwrap();
            assert_eq!(closed, Err(reason.clone()));
            assert_eq!(reader.read().await, Err(reason));
        })
        .await;
    }

    #[tokio::test]
    async fn successful_flush_after_readable_errored_rejects_close() {
        run_local(async {
            let reason: StreamError = "errored mid-flush".into();
            let (readable, writable) = TransformStream::builder(ErrorDuringFlush {
                reason: reason.clone(),
            })
            .spawn(spawn_local_fn)
            .split();
            let (_, writer) = writable.get_writer().unwrap();
            let (_, reader) = readable.get_reader().unwrap();

            let closed = timeout(Duration::from_secs(1), writer.close())
                .await
                .unwrap();
            assert_eq!(closed, Err(reason.clone()));
            assert_eq!(reader.read().await, Err(reason));
        })
        .await;
    }

    #[tokio::test]
    async fn transforms_and_closes_through_uppercase() {
        run_local(async {
            let (readable, writable) = TransformStream::builder(UppercaseTransformer)
                .spawn(spawn_local_fn)
                .split();
            let (_, writer) = writable.get_writer().unwrap();
            let (_, reader) = readable.get_reader().unwrap();

            let first = writer.write("hello".to_string());
            let second = writer.write("world".to_string());
            let closed = writer.close();

            for expected in ["HELLO", "WORLD"] {
                let chunk = timeout(Duration::from_secs(1), reader.read())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(chunk.as_deref(), Some(expected));
            }
            assert_eq!(reader.read().await, Ok(None));

            assert_eq!(first.await, Ok(()));
            assert_eq!(second.await, Ok(()));
            assert_eq!(closed.await, Ok(()));
        })
        .await;
    }
}
