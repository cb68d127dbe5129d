use super::{
    CountQueuingStrategy, Locked, QueuingStrategy, StreamResult, Unlocked, WakerSet,
    error::StreamError,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};
use futures::{
    channel::oneshot,
    future::{self, Either, poll_fn},
    sink::Sink,
};
use parking_lot::Mutex;
use pin_project::{pin_project, pinned_drop};
use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll, Waker},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Erroring,
    Errored,
    Closed,
}

// ----------- Sink Trait -----------
pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Writes are delivered one at a time, in order.
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn close(self) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        future::ready(Ok(()))
    }

    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

type Completion = oneshot::Sender<StreamResult<()>>;

enum QueueEntry<T> {
    Write {
        chunk: T,
        size: usize,
        completion: Completion,
    },
    Close,
}

struct PendingAbort {
    reason: Option<String>,
    completions: Vec<Completion>,
    was_already_erroring: bool,
}

enum WritableAction<T> {
    Write(T),
    Close,
    Abort(Option<String>),
    Finished,
}

// ----------- Inner State -----------
pub(crate) struct WritableStreamInner<T> {
    state: WritableState,
    stored_error: Option<StreamError>,
    queue: VecDeque<QueueEntry<T>>,
    queue_total_size: usize,
    strategy: BoxedStrategy<T>,
    started: bool,
    backpressure: bool,
    locked: bool,
    close_request: Option<Completion>,
    in_flight_write: Option<(usize, Completion)>,
    in_flight_close: Option<Completion>,
    pending_abort: Option<PendingAbort>,
    in_flight_abort: Option<PendingAbort>,
    abort_queued: bool,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
    task_waker: Option<Waker>,
}

impl<T: MaybeSend + 'static> WritableStreamInner<T> {
    fn new(strategy: BoxedStrategy<T>) -> Self {
        let mut inner = Self {
            state: WritableState::Writable,
            stored_error: None,
            queue: VecDeque::new(),
            queue_total_size: 0,
            strategy,
            started: false,
            backpressure: false,
            locked: false,
            close_request: None,
            in_flight_write: None,
            in_flight_close: None,
            pending_abort: None,
            in_flight_abort: None,
            abort_queued: false,
            ready_wakers: WakerSet::default(),
            closed_wakers: WakerSet::default(),
            task_waker: None,
        };
        inner.backpressure = inner.desired_size().is_some_and(|size| size <= 0);
        inner
    }

    fn get_stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or_else(|| StreamError::from("Stream is errored"))
    }

    fn wake_task(&mut self) {
        if let Some(waker) = self.task_waker.take() {
            waker.wake();
        }
    }

    fn desired_size(&self) -> Option<isize> {
        match self.state {
            WritableState::Errored | WritableState::Erroring => None,
            WritableState::Closed => Some(0),
            WritableState::Writable => {
                Some(self.strategy.high_water_mark() as isize - self.queue_total_size as isize)
            }
        }
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close.is_some()
    }

    fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write.is_some() || self.in_flight_close.is_some()
    }

    fn update_backpressure(&mut self) {
        let backpressure = self.desired_size().is_some_and(|size| size <= 0);
        if backpressure != self.backpressure {
            log::trace!("writable stream backpressure: {backpressure}");
            self.backpressure = backpressure;
            if !backpressure {
                self.ready_wakers.wake_all();
            }
        }
    }

    fn write(&mut self, chunk: T) -> Either<StreamResult<()>, oneshot::Receiver<StreamResult<()>>> {
        let size = match self.strategy.size(&chunk) {
            Ok(size) => size,
            Err(error) => {
                self.error_if_needed(error);
                1
            }
        };

        match self.state {
            WritableState::Errored => return Either::Left(Err(self.get_stored_error())),
            WritableState::Closed => return Either::Left(Err(StreamError::Closed)),
            _ if self.close_queued_or_in_flight() => {
                return Either::Left(Err(StreamError::Closing));
            }
            WritableState::Erroring => return Either::Left(Err(self.get_stored_error())),
            WritableState::Writable => {}
        }

        let (tx, rx) = oneshot::channel();
        self.queue.push_back(QueueEntry::Write {
            chunk,
            size,
            completion: tx,
        });
        self.queue_total_size += size;
        self.update_backpressure();
        self.wake_task();
        Either::Right(rx)
    }

    fn close(&mut self) -> Either<StreamResult<()>, oneshot::Receiver<StreamResult<()>>> {
        match self.state {
            WritableState::Closed | WritableState::Errored => {
                return Either::Left(Err(StreamError::TypeError(
                    "cannot close a stream that is closed or errored".into(),
                )));
            }
            _ if self.close_queued_or_in_flight() => return Either::Left(Err(StreamError::Closing)),
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        self.close_request = Some(tx);
        self.queue.push_back(QueueEntry::Close);
        // A pending close satisfies ready() even under backpressure.
        self.ready_wakers.wake_all();
        self.wake_task();
        Either::Right(rx)
    }

    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> Either<StreamResult<()>, oneshot::Receiver<StreamResult<()>>> {
        if matches!(self.state, WritableState::Closed | WritableState::Errored) {
            return Either::Left(Ok(()));
        }

        let (tx, rx) = oneshot::channel();
        if let Some(pending) = self.pending_abort.as_mut() {
            pending.completions.push(tx);
            return Either::Right(rx);
        }

        let was_already_erroring = self.state == WritableState::Erroring;
        let reason = if was_already_erroring { None } else { reason };
        log::debug!("writable stream aborted: {reason:?}");
        self.pending_abort = Some(PendingAbort {
            reason: reason.clone(),
            completions: vec![tx],
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(StreamError::Aborted(reason));
        }
        Either::Right(rx)
    }

    fn error_if_needed(&mut self, error: StreamError) {
        if self.state == WritableState::Writable {
            self.start_erroring(error);
        }
    }

    fn start_erroring(&mut self, reason: StreamError) {
        debug_assert!(self.stored_error.is_none());
        debug_assert_eq!(self.state, WritableState::Writable);
        log::debug!("writable stream erroring: {reason}");

        self.state = WritableState::Erroring;
        self.stored_error = Some(reason);
        self.ready_wakers.wake_all();
        if !self.has_operation_marked_in_flight() && self.started {
            self.finish_erroring();
        }
        self.wake_task();
    }

    fn finish_erroring(&mut self) {
        debug_assert_eq!(self.state, WritableState::Erroring);
        debug_assert!(!self.has_operation_marked_in_flight());

        self.state = WritableState::Errored;
        let stored_error = self.get_stored_error();
        for entry in self.queue.drain(..) {
            if let QueueEntry::Write { completion, .. } = entry {
                let _ = completion.send(Err(stored_error.clone()));
            }
        }
        self.queue_total_size = 0;

        match self.pending_abort.take() {
            None => self.reject_close_if_needed(),
            Some(abort) if abort.was_already_erroring => {
                for completion in abort.completions {
                    let _ = completion.send(Err(stored_error.clone()));
                }
                self.reject_close_if_needed();
            }
            Some(abort) => {
                self.in_flight_abort = Some(abort);
                self.abort_queued = true;
            }
        }

        self.ready_wakers.wake_all();
        self.closed_wakers.wake_all();
        self.wake_task();
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        if self.state == WritableState::Writable {
            self.start_erroring(error);
        } else {
            self.finish_erroring();
        }
    }

    fn reject_close_if_needed(&mut self) {
        if let Some(completion) = self.close_request.take() {
            let _ = completion.send(Err(self.get_stored_error()));
        }
    }

    fn finish_start(&mut self, result: StreamResult<()>) {
        self.started = true;
        match result {
            Ok(()) => self.wake_task(),
            Err(error) => self.deal_with_rejection(error),
        }
    }

    fn finish_write(&mut self, result: StreamResult<()>) {
        let Some((size, completion)) = self.in_flight_write.take() else {
            return;
        };
        match result {
            Ok(()) => {
                let _ = completion.send(Ok(()));
                self.queue_total_size -= size;
                if !self.close_queued_or_in_flight() && self.state == WritableState::Writable {
                    self.update_backpressure();
                }
            }
            Err(error) => {
                let _ = completion.send(Err(error.clone()));
                self.deal_with_rejection(error);
            }
        }
    }

    fn finish_close(&mut self, result: StreamResult<()>) {
        let completion = self.in_flight_close.take();
        match result {
            Ok(()) => {
                if let Some(completion) = completion {
                    let _ = completion.send(Ok(()));
                }
                if self.state == WritableState::Erroring {
                    self.stored_error = None;
                    if let Some(abort) = self.pending_abort.take() {
                        for completion in abort.completions {
                            let _ = completion.send(Ok(()));
                        }
                    }
                }
                log::trace!("writable stream closed");
                self.state = WritableState::Closed;
                self.ready_wakers.wake_all();
                self.closed_wakers.wake_all();
            }
            Err(error) => {
                if let Some(completion) = completion {
                    let _ = completion.send(Err(error.clone()));
                }
                if let Some(abort) = self.pending_abort.take() {
                    for completion in abort.completions {
                        let _ = completion.send(Err(error.clone()));
                    }
                }
                self.deal_with_rejection(error);
            }
        }
    }

    fn finish_abort(&mut self, result: StreamResult<()>) {
        if let Some(abort) = self.in_flight_abort.take() {
            for completion in abort.completions {
                let _ = completion.send(result.clone());
            }
        }
        self.reject_close_if_needed();
    }

    fn release_writer(&mut self) {
        self.locked = false;
    }

    fn poll_next_action(&mut self, cx: &mut Context<'_>) -> Poll<WritableAction<T>> {
        if self.abort_queued {
            self.abort_queued = false;
            let reason = self
                .in_flight_abort
                .as_ref()
                .and_then(|abort| abort.reason.clone());
            return Poll::Ready(WritableAction::Abort(reason));
        }

        if self.started && !self.has_operation_marked_in_flight() {
            match self.state {
                WritableState::Errored | WritableState::Closed => {
                    return Poll::Ready(WritableAction::Finished);
                }
                WritableState::Erroring => {
                    self.finish_erroring();
                    return self.poll_next_action(cx);
                }
                WritableState::Writable => match self.queue.pop_front() {
                    Some(QueueEntry::Close) => {
                        self.in_flight_close = self.close_request.take();
                        return Poll::Ready(WritableAction::Close);
                    }
                    Some(QueueEntry::Write {
                        chunk,
                        size,
                        completion,
                    }) => {
                        self.in_flight_write = Some((size, completion));
                        return Poll::Ready(WritableAction::Write(chunk));
                    }
                    None => {}
                },
            }
        }

        self.task_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        match self.state {
            WritableState::Erroring | WritableState::Errored => {
                Poll::Ready(Err(self.get_stored_error()))
            }
            WritableState::Closed => Poll::Ready(Ok(())),
            WritableState::Writable if !self.backpressure || self.close_queued_or_in_flight() => {
                Poll::Ready(Ok(()))
            }
            WritableState::Writable => {
                self.ready_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }

    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        match self.state {
            WritableState::Closed => Poll::Ready(Ok(())),
            WritableState::Errored => Poll::Ready(Err(self.get_stored_error())),
            WritableState::Writable | WritableState::Erroring => {
                self.closed_wakers.register(cx.waker());
                Poll::Pending
            }
        }
    }
}

// ----------- Controller -----------
pub struct WritableStreamDefaultController<T: MaybeSend + 'static> {
    inner: SharedPtr<Mutex<WritableStreamInner<T>>>,
}

impl<T: MaybeSend + 'static> Clone for WritableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: SharedPtr::clone(&self.inner),
        }
    }
}

impl<T: MaybeSend + 'static> WritableStreamDefaultController<T> {
    pub(crate) fn new(strategy: BoxedStrategy<T>) -> Self {
        Self {
            inner: SharedPtr::new(Mutex::new(WritableStreamInner::new(strategy))),
        }
    }

    /// Moves a writable stream into the erroring state. No effect once the
    /// stream has left the writable state.
    pub fn error(&self, error: StreamError) {
        self.inner.lock().error_if_needed(error);
    }

    /// Starts erroring if the stream is still writable.
    pub fn error_if_needed(&self, error: StreamError) {
        self.inner.lock().error_if_needed(error);
    }

    pub fn state(&self) -> WritableState {
        self.inner.lock().state
    }

    /// The error the stream failed with, once erroring has begun.
    pub fn stored_error(&self) -> Option<StreamError> {
        self.inner.lock().stored_error.clone()
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.inner.lock().desired_size()
    }
}

// ----------- Main WritableStream with Typestate -----------
pub struct WritableStream<T: MaybeSend + 'static, Sink, LockState = Unlocked> {
    controller: WritableStreamDefaultController<T>,
    _phantom: PhantomData<fn() -> (Sink, LockState)>,
}

impl<T: MaybeSend + 'static, Sink, LockState> WritableStream<T, Sink, LockState> {
    fn handle<S>(&self) -> WritableStream<T, Sink, S> {
        WritableStream {
            controller: self.controller.clone(),
            _phantom: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.controller.inner.lock().locked
    }

    pub fn state(&self) -> WritableState {
        self.controller.state()
    }
}

impl<T, Sink> WritableStream<T, Sink, Unlocked>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    /// Returns a builder for this writable stream
    pub fn builder(sink: Sink) -> WritableStreamBuilder<T, Sink> {
        WritableStreamBuilder::new(sink)
    }

    /// Attaches `sink` to an already created controller. The returned future
    /// drives the sink and must be polled for the stream to make progress.
    pub(crate) fn from_controller(
        controller: WritableStreamDefaultController<T>,
        sink: Sink,
    ) -> (Self, impl Future<Output = ()>) {
        let stream = Self {
            controller: controller.clone(),
            _phantom: PhantomData,
        };
        (stream, writable_stream_task(sink, controller))
    }
}

impl<T: MaybeSend + 'static, Sink> WritableStream<T, Sink, Unlocked> {
    #[cfg(test)]
    pub(crate) fn controller(&self) -> WritableStreamDefaultController<T> {
        self.controller.clone()
    }

    /// Errors the stream with [`StreamError::Aborted`] and runs the sink's
    /// abort once in-flight work finishes.
    pub fn abort(
        &self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let outcome = self.controller.inner.lock().abort(reason);
        settle(outcome)
    }

    /// Closes the sink after queued writes drain.
    pub fn close(&self) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let outcome = self.controller.inner.lock().close();
        settle(outcome)
    }

    pub fn get_writer(
        &self,
    ) -> StreamResult<(
        WritableStream<T, Sink, Locked>,
        WritableStreamDefaultWriter<T, Sink>,
    )> {
        {
            let mut inner = self.controller.inner.lock();
            if inner.locked {
                return Err(StreamError::TypeError("Stream already locked".into()));
            }
            inner.locked = true;
        }

        Ok((
            self.handle(),
            WritableStreamDefaultWriter::new(self.handle()),
        ))
    }
}

async fn settle(
    outcome: Either<StreamResult<()>, oneshot::Receiver<StreamResult<()>>>,
) -> StreamResult<()> {
    match outcome {
        Either::Left(result) => result,
        Either::Right(rx) => rx.await.unwrap_or(Err(StreamError::TaskDropped)),
    }
}

// ----------- Writer -----------
#[pin_project(PinnedDrop)]
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static, Sink> {
    stream: WritableStream<T, Sink, Locked>,
    released: bool,
    #[pin]
    pending_write: Option<oneshot::Receiver<StreamResult<()>>>,
    #[pin]
    pending_close: Option<oneshot::Receiver<StreamResult<()>>>,
}

impl<T: MaybeSend + 'static, Sink> WritableStreamDefaultWriter<T, Sink> {
    fn new(stream: WritableStream<T, Sink, Locked>) -> Self {
        Self {
            stream,
            released: false,
            pending_write: None,
            pending_close: None,
        }
    }

    /// Queues `chunk` and returns a future for its completion.
    ///
    /// The chunk is queued before this returns, so the future may be
    /// dropped for fire-and-forget writes. Use [`Self::ready`] to respect
    /// backpressure.
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let outcome = self.stream.controller.inner.lock().write(chunk);
        settle(outcome)
    }

    pub fn close(&self) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let outcome = self.stream.controller.inner.lock().close();
        settle(outcome)
    }

    pub fn abort(
        &self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let outcome = self.stream.controller.inner.lock().abort(reason);
        settle(outcome)
    }

    /// Resolves once the stream no longer signals backpressure.
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let inner = SharedPtr::clone(&self.stream.controller.inner);
        poll_fn(move |cx| inner.lock().poll_ready(cx))
    }

    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + use<T, Sink> {
        let inner = SharedPtr::clone(&self.stream.controller.inner);
        poll_fn(move |cx| inner.lock().poll_closed(cx))
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.stream.controller.desired_size()
    }

    pub fn release_lock(mut self) -> WritableStream<T, Sink, Unlocked> {
        self.released = true;
        self.stream.controller.inner.lock().release_writer();
        self.stream.handle()
    }
}

#[pinned_drop]
impl<T: MaybeSend + 'static, Sink> PinnedDrop for WritableStreamDefaultWriter<T, Sink> {
    fn drop(self: Pin<&mut Self>) {
        if !self.released {
            self.stream.controller.inner.lock().release_writer();
        }
    }
}

fn poll_completion(
    mut slot: Pin<&mut Option<oneshot::Receiver<StreamResult<()>>>>,
    cx: &mut Context<'_>,
) -> Poll<StreamResult<()>> {
    let Some(rx) = slot.as_mut().as_pin_mut() else {
        return Poll::Ready(Ok(()));
    };
    match rx.poll(cx) {
        Poll::Ready(result) => {
            slot.set(None);
            Poll::Ready(result.unwrap_or(Err(StreamError::TaskDropped)))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<T: MaybeSend + 'static, S> Sink<T> for WritableStreamDefaultWriter<T, S> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().stream.controller.inner.lock().poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        let mut this = self.project();
        match this.stream.controller.inner.lock().write(item) {
            Either::Left(result) => result,
            // Writes complete in order, so flushing only needs the latest.
            Either::Right(rx) => {
                this.pending_write.set(Some(rx));
                Ok(())
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        poll_completion(self.project().pending_write, cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();
        if let Poll::Ready(Err(error)) = poll_completion(this.pending_write.as_mut(), cx) {
            return Poll::Ready(Err(error));
        }
        if this.pending_close.is_none() {
            let mut inner = this.stream.controller.inner.lock();
            if inner.state == WritableState::Closed {
                return Poll::Ready(Ok(()));
            }
            match inner.close() {
                Either::Left(result) => return Poll::Ready(result),
                Either::Right(rx) => this.pending_close.set(Some(rx)),
            }
        }
        poll_completion(this.pending_close, cx)
    }
}

// ----------- Stream Task Implementation -----------
async fn writable_stream_task<T, Sink>(
    sink: Sink,
    mut controller: WritableStreamDefaultController<T>,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    let inner = SharedPtr::clone(&controller.inner);
    let mut sink = Some(sink);

    if let Some(sink) = sink.as_mut() {
        let started = sink.start(&mut controller).await;
        inner.lock().finish_start(started);
    }

    loop {
        let action = poll_fn(|cx| inner.lock().poll_next_action(cx)).await;
        match action {
            WritableAction::Write(chunk) => {
                let result = match sink.as_mut() {
                    Some(sink) => sink.write(chunk, &mut controller).await,
                    None => Err(StreamError::Closed),
                };
                inner.lock().finish_write(result);
            }
            WritableAction::Close => {
                log::trace!("writable stream closing sink");
                let result = match sink.take() {
                    Some(sink) => sink.close().await,
                    None => Ok(()),
                };
                inner.lock().finish_close(result);
            }
            WritableAction::Abort(reason) => {
                let result = match sink.as_mut() {
                    Some(sink) => sink.abort(reason).await,
                    None => Ok(()),
                };
                inner.lock().finish_abort(result);
            }
            WritableAction::Finished => break,
        }
    }
    log::trace!("writable stream task finished");
}

// ----------- Builder Pattern Implementation -----------
pub struct WritableStreamBuilder<T: MaybeSend + 'static, Sink> {
    sink: Sink,
    strategy: BoxedStrategy<T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T>,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(self) -> (WritableStream<T, Sink, Unlocked>, impl Future<Output = ()>) {
        WritableStream::from_controller(WritableStreamDefaultController::new(self.strategy), self.sink)
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> WritableStream<T, Sink, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> WritableStream<T, Sink, Unlocked>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}
