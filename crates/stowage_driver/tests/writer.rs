mod common;

use rstest::*;

use stowage_driver::{Error, Result, StateError, WriterState};
use stowage_objectstore::ObjectStore;

use common::*;

const KEY: &str = "docker/registry/v2/blobs/sha256/ab/abcd/data";

async fn write_in_splits(min: u64, chunk: u64, splits: &[usize]) -> Result<TestStore> {
    let store = TestStore::new(min);
    let total: usize = splits.iter().sum();
    let content = payload(total);

    let mut w = open_writer(&store, min, chunk, KEY, false).await?;
    let mut offset = 0;
    for n in splits {
        assert_eq!(w.write(&content[offset..offset + n]).await?, *n);
        offset += n;
    }
    assert_eq!(w.size(), total as u64);
    w.commit().await?;

    assert_eq!(store.content(KEY).await, Some(content));
    Ok(store)
}

#[tokio::test]
async fn single_write_emits_trailing_part_on_commit() -> Result<()> {
    init_tracing();
    let store = write_in_splits(10, 10, &[25]).await?;
    assert_eq!(store.completed(), vec![vec![(1, 10), (2, 10), (3, 5)]]);
    Ok(())
}

#[tokio::test]
async fn small_object_commits_as_single_part() -> Result<()> {
    let store = write_in_splits(10, 10, &[5]).await?;
    assert_eq!(store.completed(), vec![vec![(1, 5)]]);
    Ok(())
}

#[tokio::test]
async fn cancel_aborts_without_completing() -> Result<()> {
    let store = TestStore::new(10);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;
    w.write(&payload(10)).await?;
    w.cancel().await?;

    assert_eq!(store.count("abort_multipart_upload"), 1);
    assert_eq!(store.count("complete_multipart_upload"), 0);
    assert_eq!(store.count("upload_part"), 0);
    assert_eq!(store.content(KEY).await, None);
    assert!(matches!(
        w.write(b"more").await,
        Err(Error::State(StateError::Cancelled))
    ));
    Ok(())
}

#[rstest]
#[case::one_call(&[47])]
#[case::bytewise(&[1; 47])]
#[case::chunk_aligned(&[10, 10, 10, 10, 7])]
#[case::straddling(&[9, 2, 19, 17])]
#[case::large_then_small(&[40, 3, 4])]
#[case::small_then_large(&[3, 44])]
#[tokio::test]
async fn part_sizes_ignore_write_boundaries(#[case] splits: &[usize]) -> Result<()> {
    let store = write_in_splits(10, 10, splits).await?;
    assert_eq!(
        store.completed(),
        vec![vec![(1, 10), (2, 10), (3, 10), (4, 10), (5, 7)]]
    );
    Ok(())
}

#[rstest]
#[case(10, 12, &[100])]
#[case(10, 16, &[7, 7, 7, 7, 7, 7, 7, 7])]
#[case(5, 5, &[3, 1, 4, 1, 5, 9, 2, 6])]
#[case(8, 20, &[19, 1, 20, 21])]
#[tokio::test]
async fn committed_parts_are_contiguous_and_above_floor(
    #[case] min: u64,
    #[case] chunk: u64,
    #[case] splits: &[usize],
) -> Result<()> {
    let store = write_in_splits(min, chunk, splits).await?;
    let completed = store.completed();
    assert_eq!(completed.len(), 1);
    let parts = &completed[0];

    for (i, (number, _)) in parts.iter().enumerate() {
        assert_eq!(*number, i as i32 + 1);
    }
    for (_, size) in &parts[..parts.len() - 1] {
        assert!(*size >= min, "non-final part of {size} bytes in {parts:?}");
    }
    let total: u64 = parts.iter().map(|(_, size)| size).sum();
    assert_eq!(total, splits.iter().sum::<usize>() as u64);
    Ok(())
}

#[rstest]
#[case::close("close")]
#[case::commit("commit")]
#[case::cancel("cancel")]
#[tokio::test]
async fn terminal_states_are_exclusive(#[case] terminal: &str) -> Result<()> {
    let store = TestStore::new(10);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;
    w.write(&payload(12)).await?;

    let (state, expected) = match terminal {
        "close" => {
            w.close().await?;
            (WriterState::Closed, StateError::Closed)
        }
        "commit" => {
            w.commit().await?;
            (WriterState::Committed, StateError::Committed)
        }
        _ => {
            w.cancel().await?;
            (WriterState::Cancelled, StateError::Cancelled)
        }
    };
    assert_eq!(w.state(), state);
    store.clear_ops();

    for result in [
        w.write(b"x").await.map(|_| ()),
        w.close().await,
        w.commit().await,
        w.cancel().await,
    ] {
        match result {
            Err(Error::State(e)) => assert_eq!(e, expected),
            other => panic!("expected {expected:?}, got {other:?}"),
        }
    }
    assert_eq!(w.state(), state);
    assert!(store.ops().is_empty());
    Ok(())
}

#[tokio::test]
async fn size_counts_bytes_consumed_before_a_failed_flush() -> Result<()> {
    let store = TestStore::new(10);
    let content = payload(25);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;

    store.fail("upload_part", 1);
    assert!(w.write(&content).await.is_err());
    assert_eq!(w.size(), 20);
    assert!(w.parts().is_empty());

    assert_eq!(w.write(&content[20..]).await?, 5);
    assert_eq!(w.size(), 25);
    w.commit().await?;

    assert_eq!(store.completed(), vec![vec![(1, 10), (2, 10), (3, 5)]]);
    assert_eq!(store.content(KEY).await, Some(content));
    Ok(())
}

#[tokio::test]
async fn close_folds_trailing_remainder_into_last_part() -> Result<()> {
    let store = TestStore::new(10);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;
    w.write(&payload(25)).await?;
    w.close().await?;

    assert_eq!(store.uploaded_part_sizes(), vec![10, 15]);
    assert_eq!(store.count("complete_multipart_upload"), 0);
    assert_eq!(store.count("abort_multipart_upload"), 0);
    assert_eq!(store.content(KEY).await, None);
    Ok(())
}

#[tokio::test]
async fn failed_commit_flush_leaves_writer_open() -> Result<()> {
    let store = TestStore::new(10);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;
    w.write(&payload(5)).await?;

    store.fail("upload_part", 1);
    assert!(w.commit().await.is_err());
    assert_eq!(w.state(), WriterState::Open);
    assert_eq!(store.count("complete_multipart_upload"), 0);

    w.commit().await?;
    assert_eq!(w.state(), WriterState::Committed);
    assert_eq!(store.completed(), vec![vec![(1, 5)]]);
    Ok(())
}

#[tokio::test]
async fn failed_complete_aborts_session() -> Result<()> {
    let store = TestStore::new(10);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;
    w.write(&payload(15)).await?;

    store.fail("complete_multipart_upload", 1);
    match w.commit().await {
        Err(Error::ObjectStoreError(e)) => assert!(e.is_transport()),
        other => panic!("expected transport error, got {other:?}"),
    }
    assert_eq!(w.state(), WriterState::Committed);
    assert_eq!(store.count("abort_multipart_upload"), 1);
    assert_eq!(store.content(KEY).await, None);

    let uploads = store.inner.list_multipart_uploads("", None).await?;
    assert!(uploads.uploads.is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_abort_does_not_mask_complete_error() -> Result<()> {
    let store = TestStore::new(10);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;
    w.write(&payload(5)).await?;

    store.fail("complete_multipart_upload", 1);
    store.fail("abort_multipart_upload", 1);
    let err = w.commit().await.err().unwrap();
    assert!(err.to_string().contains("complete_multipart_upload"), "{err}");
    assert_eq!(w.state(), WriterState::Committed);
    Ok(())
}

#[tokio::test]
async fn failed_cancel_abort_is_reported_but_final() -> Result<()> {
    let store = TestStore::new(10);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;
    w.write(&payload(5)).await?;

    store.fail("abort_multipart_upload", 1);
    assert!(w.cancel().await.is_err());
    assert_eq!(w.state(), WriterState::Cancelled);
    assert!(matches!(
        w.write(b"x").await,
        Err(Error::State(StateError::Cancelled))
    ));
    Ok(())
}

#[tokio::test]
async fn empty_commit_writes_empty_object() -> Result<()> {
    let store = TestStore::new(10);
    let mut w = open_writer(&store, 10, 10, KEY, false).await?;
    assert_eq!(w.write(&[]).await?, 0);
    w.commit().await?;

    assert_eq!(store.count("complete_multipart_upload"), 0);
    assert_eq!(store.count("abort_multipart_upload"), 1);
    assert_eq!(store.content(KEY).await, Some(Vec::new()));
    Ok(())
}

#[tokio::test]
async fn dropped_writer_returns_buffers_to_pool() -> Result<()> {
    let store = TestStore::new(10);
    let pool = pool(10);
    {
        let mut w = stowage_driver::MultipartWriter::open(
            std::sync::Arc::new(store.clone()),
            stowage_driver::ChunkSizePolicy::new(10, 10)?,
            pool.clone(),
            &key_of(KEY),
            false,
        )
        .await?;
        w.write(&payload(13)).await?;
        w.cancel().await?;
    }
    assert_eq!(pool.idle_count(), 2);
    Ok(())
}
