use super::{
    CountQueuingStrategy, Locked, QueuingStrategy, StreamResult, Unlocked, WakerSet,
    error::StreamError,
};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformFuture, SharedPtr};
use futures::{
    channel::oneshot,
    future::{self, Either, poll_fn},
    stream::Stream,
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
pub enum ReadableState {
    Readable,
    Closed,
    Errored,
}

// ----------- Source Trait -----------
pub trait ReadableSource<T: MaybeSend + 'static>: MaybeSend + 'static {
    fn start(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(()))
    }

    /// Called when the stream wants more data. At most one pull is in
    /// flight at a time.
    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(()))
    }
}

type ReadRequest<T> = oneshot::Sender<StreamResult<Option<T>>>;

enum ReadableAction {
    Pull,
    Cancel {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Finished,
}

// ----------- Inner State -----------
pub(crate) struct ReadableStreamInner<T> {
    state: ReadableState,
    stored_error: Option<StreamError>,
    queue: VecDeque<(T, usize)>,
    queue_total_size: usize,
    high_water_mark: usize,
    started: bool,
    close_requested: bool,
    pulling: bool,
    pull_requested: bool,
    locked: bool,
    read_requests: VecDeque<ReadRequest<T>>,
    cancel_request: Option<(Option<String>, oneshot::Sender<StreamResult<()>>)>,
    closed_wakers: WakerSet,
    task_waker: Option<Waker>,
}

impl<T: MaybeSend + 'static> ReadableStreamInner<T> {
    fn new(high_water_mark: usize) -> Self {
        Self {
            state: ReadableState::Readable,
            stored_error: None,
            queue: VecDeque::new(),
            queue_total_size: 0,
            high_water_mark,
            started: false,
            close_requested: false,
            pulling: false,
            pull_requested: false,
            locked: false,
            read_requests: VecDeque::new(),
            cancel_request: None,
            closed_wakers: WakerSet::default(),
            task_waker: None,
        }
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
            ReadableState::Errored => None,
            ReadableState::Closed => Some(0),
            ReadableState::Readable => {
                Some(self.high_water_mark as isize - self.queue_total_size as isize)
            }
        }
    }

    fn can_close_or_enqueue(&self) -> bool {
        !self.close_requested && self.state == ReadableState::Readable
    }

    fn has_live_read_requests(&self) -> bool {
        self.read_requests.iter().any(|request| !request.is_canceled())
    }

    fn should_call_pull(&self) -> bool {
        if !self.can_close_or_enqueue() || !self.started {
            return false;
        }
        if self.has_live_read_requests() {
            return true;
        }
        self.desired_size().is_some_and(|size| size > 0)
    }

    fn call_pull_if_needed(&mut self) {
        if self.should_call_pull() {
            self.pull_requested = true;
            self.wake_task();
        }
    }

    /// Hands `chunk` to the oldest live read request. Returns it back when
    /// nobody is waiting, in which case it has to be sized and queued.
    fn fulfill_read_request(&mut self, chunk: T) -> StreamResult<Option<T>> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::TypeError(
                "readable stream cannot close or enqueue".into(),
            ));
        }

        let mut chunk = chunk;
        while let Some(request) = self.read_requests.pop_front() {
            match request.send(Ok(Some(chunk))) {
                Ok(()) => {
                    self.call_pull_if_needed();
                    return Ok(None);
                }
                // The reader stopped waiting; hand the chunk to the next one.
                Err(returned) => match returned {
                    Ok(Some(returned)) => chunk = returned,
                    _ => return Ok(None),
                },
            }
        }
        Ok(Some(chunk))
    }

    fn enqueue_sized(&mut self, chunk: T, size: usize) -> StreamResult<()> {
        // A reader may have arrived while the chunk was being sized.
        let Some(chunk) = self.fulfill_read_request(chunk)? else {
            return Ok(());
        };
        self.queue.push_back((chunk, size));
        self.queue_total_size += size;
        self.call_pull_if_needed();
        Ok(())
    }

    fn close(&mut self) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::TypeError(
                "readable stream cannot be closed".into(),
            ));
        }
        self.close_requested = true;
        if self.queue.is_empty() {
            self.close_stream();
        }
        Ok(())
    }

    fn close_stream(&mut self) {
        log::trace!("readable stream closed");
        self.state = ReadableState::Closed;
        for request in self.read_requests.drain(..) {
            let _ = request.send(Ok(None));
        }
        self.closed_wakers.wake_all();
        self.wake_task();
    }

    fn error(&mut self, error: StreamError) {
        if self.state != ReadableState::Readable {
            return;
        }
        log::debug!("readable stream errored: {error}");
        self.queue.clear();
        self.queue_total_size = 0;
        self.state = ReadableState::Errored;
        self.stored_error = Some(error.clone());
        for request in self.read_requests.drain(..) {
            let _ = request.send(Err(error.clone()));
        }
        self.closed_wakers.wake_all();
        self.wake_task();
    }

    fn read(&mut self) -> Either<StreamResult<Option<T>>, oneshot::Receiver<StreamResult<Option<T>>>> {
        match self.state {
            ReadableState::Errored => Either::Left(Err(self.get_stored_error())),
            ReadableState::Closed => Either::Left(Ok(None)),
            ReadableState::Readable => {
                if let Some((chunk, size)) = self.queue.pop_front() {
                    self.queue_total_size -= size;
                    if self.close_requested && self.queue.is_empty() {
                        self.close_stream();
                    } else {
                        self.call_pull_if_needed();
                    }
                    return Either::Left(Ok(Some(chunk)));
                }
                let (tx, rx) = oneshot::channel();
                self.read_requests.push_back(tx);
                self.call_pull_if_needed();
                Either::Right(rx)
            }
        }
    }

    fn cancel(
        &mut self,
        reason: Option<String>,
    ) -> Either<StreamResult<()>, oneshot::Receiver<StreamResult<()>>> {
        match self.state {
            ReadableState::Closed => Either::Left(Ok(())),
            ReadableState::Errored => Either::Left(Err(self.get_stored_error())),
            ReadableState::Readable => {
                log::debug!("readable stream canceled: {reason:?}");
                self.close_stream();
                self.queue.clear();
                self.queue_total_size = 0;
                let (tx, rx) = oneshot::channel();
                self.cancel_request = Some((reason, tx));
                self.wake_task();
                Either::Right(rx)
            }
        }
    }

    fn release_reader(&mut self) {
        self.locked = false;
        for request in self.read_requests.drain(..) {
            let _ = request.send(Err(StreamError::TypeError("reader was released".into())));
        }
    }

    fn poll_next_action(&mut self, cx: &mut Context<'_>) -> Poll<ReadableAction> {
        if let Some((reason, completion)) = self.cancel_request.take() {
            return Poll::Ready(ReadableAction::Cancel { reason, completion });
        }
        if self.state != ReadableState::Readable {
            return Poll::Ready(ReadableAction::Finished);
        }
        if !self.pulling && self.pull_requested {
            self.pull_requested = false;
            if self.should_call_pull() {
                self.pulling = true;
                return Poll::Ready(ReadableAction::Pull);
            }
        }
        self.task_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Ready once a pending pull can no longer matter.
    fn poll_settled(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if self.state != ReadableState::Readable || self.cancel_request.is_some() {
            return Poll::Ready(());
        }
        self.task_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    fn finish_start(&mut self, result: StreamResult<()>) {
        match result {
            Ok(()) => {
                self.started = true;
                self.call_pull_if_needed();
            }
            Err(error) => self.error(error),
        }
    }

    fn finish_pull(&mut self, outcome: Option<StreamResult<()>>) {
        self.pulling = false;
        if let Some(Err(error)) = outcome {
            self.error(error);
        }
    }
}

// ----------- Controller -----------
pub struct ReadableStreamDefaultController<T: MaybeSend + 'static> {
    inner: SharedPtr<Mutex<ReadableStreamInner<T>>>,
    // Kept apart from `inner` so the size function runs without the state
    // lock held.
    strategy: SharedPtr<Mutex<BoxedStrategy<T>>>,
}

impl<T: MaybeSend + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: SharedPtr::clone(&self.inner),
            strategy: SharedPtr::clone(&self.strategy),
        }
    }
}

impl<T: MaybeSend + 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn new(strategy: BoxedStrategy<T>) -> Self {
        let high_water_mark = strategy.high_water_mark();
        Self {
            inner: SharedPtr::new(Mutex::new(ReadableStreamInner::new(high_water_mark))),
            strategy: SharedPtr::new(Mutex::new(strategy)),
        }
    }

    /// `None` once errored, `0` once closed.
    pub fn desired_size(&self) -> Option<isize> {
        self.inner.lock().desired_size()
    }

    /// Fails with [`StreamError::TypeError`] when the stream is closing,
    /// closed or errored; fails with the size function's error (after
    /// erroring the stream) when the chunk cannot be sized.
    ///
    /// A chunk handed straight to a waiting reader is never sized.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        let Some(chunk) = self.inner.lock().fulfill_read_request(chunk)? else {
            return Ok(());
        };

        let sized = self.strategy.lock().size(&chunk);
        let mut inner = self.inner.lock();
        match sized {
            Ok(size) => inner.enqueue_sized(chunk, size),
            Err(error) => {
                inner.error(error.clone());
                Err(error)
            }
        }
    }

    /// Requests a close. The stream closes once queued chunks are read.
    pub fn close(&self) -> StreamResult<()> {
        self.inner.lock().close()
    }

    /// Errors the stream, dropping queued chunks. No-op unless readable.
    pub fn error(&self, error: StreamError) {
        self.inner.lock().error(error);
    }

    /// True while the stream is readable and no close has been requested.
    pub fn can_close_or_enqueue(&self) -> bool {
        self.inner.lock().can_close_or_enqueue()
    }

    /// Whether a pull would be issued now: started, not closing, and either
    /// a reader is waiting or the queue is below its high-water mark.
    pub fn should_call_pull(&self) -> bool {
        self.inner.lock().should_call_pull()
    }

    pub fn state(&self) -> ReadableState {
        self.inner.lock().state
    }

    /// The first error recorded for the stream, if any.
    pub fn stored_error(&self) -> Option<StreamError> {
        self.inner.lock().stored_error.clone()
    }
}

// ----------- Main ReadableStream with Typestate -----------
pub struct ReadableStream<T: MaybeSend + 'static, Source, LockState = Unlocked> {
    controller: ReadableStreamDefaultController<T>,
    _phantom: PhantomData<fn() -> (Source, LockState)>,
}

impl<T: MaybeSend + 'static, Source, LockState> ReadableStream<T, Source, LockState> {
    fn handle<S>(&self) -> ReadableStream<T, Source, S> {
        ReadableStream {
            controller: self.controller.clone(),
            _phantom: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.controller.inner.lock().locked
    }

    pub fn state(&self) -> ReadableState {
        self.controller.state()
    }
}

impl<T, Source> ReadableStream<T, Source, Unlocked>
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    /// Returns a builder for this readable stream
    pub fn builder(source: Source) -> ReadableStreamBuilder<T, Source> {
        ReadableStreamBuilder::new(source)
    }

    /// Attaches `source` to an already created controller. The returned
    /// future drives the source and must be polled for the stream to make
    /// progress.
    pub(crate) fn from_controller(
        controller: ReadableStreamDefaultController<T>,
        source: Source,
    ) -> (Self, impl Future<Output = ()>) {
        let stream = Self {
            controller: controller.clone(),
            _phantom: PhantomData,
        };
        (stream, readable_stream_task(source, controller))
    }
}

impl<T: MaybeSend + 'static, Source> ReadableStream<T, Source, Unlocked> {
    pub fn cancel(
        &self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + use<T, Source> {
        let outcome = self.controller.inner.lock().cancel(reason);
        settle(outcome)
    }

    pub fn get_reader(
        &self,
    ) -> StreamResult<(
        ReadableStream<T, Source, Locked>,
        ReadableStreamDefaultReader<T, Source>,
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
            ReadableStreamDefaultReader::new(self.handle()),
        ))
    }
}

async fn settle<R>(outcome: Either<StreamResult<R>, oneshot::Receiver<StreamResult<R>>>) -> StreamResult<R> {
    match outcome {
        Either::Left(result) => result,
        Either::Right(rx) => rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped)),
    }
}

// ----------- Reader -----------
#[pin_project(PinnedDrop)]
pub struct ReadableStreamDefaultReader<T: MaybeSend + 'static, Source> {
    stream: ReadableStream<T, Source, Locked>,
    released: bool,
    #[pin]
    pending_read: Option<oneshot::Receiver<StreamResult<Option<T>>>>,
}

impl<T: MaybeSend + 'static, Source> ReadableStreamDefaultReader<T, Source> {
    fn new(stream: ReadableStream<T, Source, Locked>) -> Self {
        Self {
            stream,
            released: false,
            pending_read: None,
        }
    }

    /// Resolves with the next chunk, or `None` once the stream is closed.
    ///
    /// The read request is registered before this returns, so requests
    /// issued back to back are served in order even if awaited later.
    pub fn read(&self) -> impl Future<Output = StreamResult<Option<T>>> + use<T, Source> {
        let outcome = self.stream.controller.inner.lock().read();
        settle(outcome)
    }

    pub fn cancel(
        &self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + use<T, Source> {
        let outcome = self.stream.controller.inner.lock().cancel(reason);
        settle(outcome)
    }

    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> + use<T, Source> {
        let inner = SharedPtr::clone(&self.stream.controller.inner);
        poll_fn(move |cx| {
            let mut inner = inner.lock();
            match inner.state {
                ReadableState::Closed => Poll::Ready(Ok(())),
                ReadableState::Errored => Poll::Ready(Err(inner.get_stored_error())),
                ReadableState::Readable => {
                    inner.closed_wakers.register(cx.waker());
                    Poll::Pending
                }
            }
        })
    }

    pub fn desired_size(&self) -> Option<isize> {
        self.stream.controller.desired_size()
    }

    /// Releases the lock. Outstanding read requests fail with a
    /// [`StreamError::TypeError`].
    pub fn release_lock(mut self) -> ReadableStream<T, Source, Unlocked> {
        self.released = true;
        self.stream.controller.inner.lock().release_reader();
        self.stream.handle()
    }
}

#[pinned_drop]
impl<T: MaybeSend + 'static, Source> PinnedDrop for ReadableStreamDefaultReader<T, Source> {
    fn drop(self: Pin<&mut Self>) {
        if !self.released {
            self.stream.controller.inner.lock().release_reader();
        }
    }
}

impl<T: MaybeSend + 'static, Source> Stream for ReadableStreamDefaultReader<T, Source> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if this.pending_read.is_none() {
            match this.stream.controller.inner.lock().read() {
                Either::Left(result) => return Poll::Ready(result.transpose()),
                Either::Right(rx) => this.pending_read.set(Some(rx)),
            }
        }

        let Some(rx) = this.pending_read.as_mut().as_pin_mut() else {
            return Poll::Ready(None);
        };
        match rx.poll(cx) {
            Poll::Ready(result) => {
                this.pending_read.set(None);
                let result = result.unwrap_or_else(|_| Err(StreamError::TaskDropped));
                Poll::Ready(result.transpose())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ----------- Stream Task Implementation -----------
async fn readable_stream_task<T, Source>(
    mut source: Source,
    mut controller: ReadableStreamDefaultController<T>,
) where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    let inner = SharedPtr::clone(&controller.inner);

    let started = source.start(&mut controller).await;
    inner.lock().finish_start(started);

    loop {
        let action = poll_fn(|cx| inner.lock().poll_next_action(cx)).await;
        match action {
            ReadableAction::Pull => {
                log::trace!("readable stream pulling from source");
                let outcome = {
                    let pull = source.pull(&mut controller);
                    let settled = poll_fn(|cx| inner.lock().poll_settled(cx));
                    futures::pin_mut!(pull, settled);
                    match future::select(pull, settled).await {
                        Either::Left((result, _)) => Some(result),
                        Either::Right(((), _)) => None,
                    }
                };
                inner.lock().finish_pull(outcome);
            }
            ReadableAction::Cancel { reason, completion } => {
                let result = source.cancel(reason).await;
                let _ = completion.send(result);
            }
            ReadableAction::Finished => break,
        }
    }
    log::trace!("readable stream task finished");
}

// ----------- Builder Pattern Implementation -----------
pub struct ReadableStreamBuilder<T: MaybeSend + 'static, Source> {
    source: Source,
    strategy: BoxedStrategy<T>,
}

impl<T, Source> ReadableStreamBuilder<T, Source>
where
    T: MaybeSend + 'static,
    Source: ReadableSource<T>,
{
    fn new(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + MaybeSend + 'static>(mut self, s: S) -> Self {
        self.strategy = Box::new(s);
        self
    }

    /// Return stream + future without spawning
    pub fn prepare(self) -> (ReadableStream<T, Source, Unlocked>, impl Future<Output = ()>) {
        ReadableStream::from_controller(
            ReadableStreamDefaultController::new(self.strategy),
            self.source,
        )
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<T, Source, Unlocked>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }

    /// Spawn using a static spawner function reference
    pub fn spawn_ref<F, R>(self, spawn_fn: &'static F) -> ReadableStream<T, Source, Unlocked>
    where
        F: Fn(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare();
        spawn_fn(Box::pin(fut));
        stream
    }
}

// ----------- Iterator Source -----------
/// Source that enqueues one item per pull and closes when exhausted.
pub struct IteratorSource<I> {
    iter: I,
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + MaybeSend + 'static,
    T: MaybeSend + 'static,
{
    fn pull(
        &mut self,
        controller: &mut ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let result = match self.iter.next() {
            Some(item) => controller.enqueue(item),
            None => controller.close(),
        };
        future::ready(result)
    }
}

impl<T: MaybeSend + 'static> ReadableStream<T, IteratorSource<std::vec::IntoIter<T>>, Unlocked> {
    /// Create from Vec
    pub fn from_vec(
        vec: Vec<T>,
    ) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        ReadableStreamBuilder::new(IteratorSource {
            iter: vec.into_iter(),
        })
    }
}
