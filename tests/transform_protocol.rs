mod common;

use common::*;
use futures::{StreamExt, stream};
use transform_streams::{
    CountQueuingStrategy, SizeQueuingStrategy, StreamError, StreamResult, TransformStream,
    WritableState,
};

#[tokio::test]
async fn framed_stream_emits_start_and_flush_chunks() {
    run_local(async {
        let (readable, writable) = TransformStream::builder(Framed).spawn(spawn_local).split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        let write = writer.write("body".to_string());
        let closed = writer.close();

        let chunks: Vec<String> = within(reader.map(|chunk| chunk.unwrap()).collect()).await;
        assert_eq!(chunks, vec!["<", "body", ">"]);
        assert_eq!(write.await, Ok(()));
        assert_eq!(closed.await, Ok(()));
    })
    .await;
}

#[tokio::test]
async fn buffered_readable_accepts_writes_ahead_of_reads() {
    run_local(async {
        let stream = TransformStream::builder(Doubler)
            .readable_strategy(CountQueuingStrategy::new(4))
            .spawn(spawn_local);
        let (readable, writable) = stream.split();
        let (_, writer) = writable.get_writer().unwrap();

        for n in 1..=3 {
            within(writer.write(n)).await.unwrap();
        }
        within(writer.close()).await.unwrap();

        let (_, reader) = readable.get_reader().unwrap();
        let values: Vec<StreamResult<i32>> = within(reader.collect()).await;
        assert_eq!(values, vec![Ok(2), Ok(4), Ok(6)]);
    })
    .await;
}

#[tokio::test]
async fn abort_errors_readable_with_abort_reason() {
    run_local(async {
        let (readable, writable) = TransformStream::builder(Doubler).spawn(spawn_local).split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        within(writer.abort(Some("bye".into()))).await.unwrap();

        let reason = StreamError::Aborted(Some("bye".into()));
        assert_eq!(within(reader.read()).await, Err(reason.clone()));
        assert_eq!(within(reader.closed()).await, Err(reason.clone()));
        assert_eq!(writer.write(1).await, Err(reason));
    })
    .await;
}

#[tokio::test]
async fn cancel_unblocks_pending_write_with_cancel_reason() {
    run_local(async {
        let (readable, writable) = TransformStream::builder(Doubler).spawn(spawn_local).split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        let blocked = writer.write(1);
        within(reader.cancel(Some("enough".into()))).await.unwrap();

        let reason = StreamError::Canceled(Some("enough".into()));
        assert_eq!(within(blocked).await, Err(reason.clone()));
        assert_eq!(within(writer.closed()).await, Err(reason.clone()));
        assert_eq!(writer.write(2).await, Err(reason));
        assert_eq!(reader.read().await, Ok(None));
    })
    .await;
}

#[tokio::test]
async fn terminate_closes_readable_and_errors_writable() {
    run_local(async {
        let (readable, writable) = TransformStream::builder(StopAtZero).spawn(spawn_local).split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        let first = writer.write(1);
        assert_eq!(within(reader.read()).await, Ok(Some(1)));
        assert_eq!(first.await, Ok(()));

        let stop = writer.write(0);
        assert_eq!(within(reader.read()).await, Ok(None));
        assert_eq!(within(stop).await, Ok(()));

        assert_eq!(within(writer.closed()).await, Err(StreamError::Terminated));
        assert_eq!(writer.write(5).await, Err(StreamError::Terminated));
        assert_eq!(writable.state(), WritableState::Errored);
    })
    .await;
}

#[tokio::test]
async fn transform_failure_rejects_write_and_errors_readable() {
    run_local(async {
        let reason: StreamError = "three is not allowed".into();
        let (readable, writable) = TransformStream::builder(FailOn {
            value: 3,
            reason: reason.clone(),
        })
        .spawn(spawn_local)
        .split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        let ok = writer.write(1);
        assert_eq!(within(reader.read()).await, Ok(Some(1)));
        assert_eq!(ok.await, Ok(()));

        let failing = writer.write(3);
        assert_eq!(within(reader.read()).await, Err(reason.clone()));
        assert_eq!(within(failing).await, Err(reason));
        assert!(matches!(
            writer.close().await,
            Err(StreamError::TypeError(_))
        ));
    })
    .await;
}

#[tokio::test]
async fn start_failure_errors_both_sides() {
    run_local(async {
        let reason: StreamError = "no start".into();
        let (readable, writable) = TransformStream::builder(FailingStart {
            reason: reason.clone(),
        })
        .spawn(spawn_local)
        .split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        assert_eq!(within(reader.read()).await, Err(reason.clone()));
        assert_eq!(within(writer.closed()).await, Err(reason.clone()));
        assert_eq!(writer.write(1).await, Err(reason));
    })
    .await;
}

#[tokio::test]
async fn readable_size_failure_surfaces_on_write_and_read() {
    run_local(async {
        let stream = TransformStream::<i32, i32>::identity()
            .readable_strategy(SizeQueuingStrategy::new(
                4,
                |chunk: &i32| -> StreamResult<usize> {
                    if *chunk < 0 {
                        Err(StreamError::TypeError("negative chunk".into()))
                    } else {
                        Ok(1)
                    }
                },
            ))
            .spawn(spawn_local);
        let (readable, writable) = stream.split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        within(writer.write(1)).await.unwrap();
        let error = within(writer.write(-1)).await.unwrap_err();
        assert_eq!(error, StreamError::TypeError("negative chunk".into()));
        assert_eq!(reader.read().await, Err(error));
    })
    .await;
}

#[tokio::test]
async fn writer_sink_forwards_into_reader_stream() {
    run_local(async {
        let (readable, writable) = TransformStream::builder(Uppercase).spawn(spawn_local).split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        let input = stream::iter(["a", "b", "c"].map(|s| Ok(s.to_string())));
        let (forwarded, output) = within(async {
            futures::join!(input.forward(writer), reader.collect::<Vec<_>>())
        })
        .await;

        assert_eq!(forwarded, Ok(()));
        let output: Vec<String> = output.into_iter().map(Result::unwrap).collect();
        assert_eq!(output, vec!["A", "B", "C"]);
    })
    .await;
}

#[tokio::test]
async fn backpressure_tracks_reader_demand() {
    run_local(async {
        let stream = TransformStream::builder(Doubler).spawn(spawn_local);
        assert!(stream.backpressure());

        let (readable, writable) = stream.split();
        let (_, writer) = writable.get_writer().unwrap();
        let (_, reader) = readable.get_reader().unwrap();

        // Each read lets exactly one queued write through.
        let writes: Vec<_> = (1..=3).map(|n| writer.write(n)).collect();
        for expected in [2, 4, 6] {
            assert_eq!(within(reader.read()).await, Ok(Some(expected)));
        }
        for write in writes {
            assert_eq!(within(write).await, Ok(()));
        }
    })
    .await;
}
