use super::*;
use crate::matrix::{MediaInfo, MessageEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_millis(100);
const ROOM: &str = "!room:example.org";
const ALICE: &str = "@alice:example.org";

/// Collects the bodies handed to delivery callbacks.
#[derive(Clone, Default)]
struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, entry: String) {
        self.entries.lock().expect("recorder lock").push(entry);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.entries.lock().expect("recorder lock"))
    }

    fn text_only(
        &self,
    ) -> impl FnOnce(MessageEvent) -> futures_util::future::Ready<anyhow::Result<()>> {
        let recorder = self.clone();
        move |event| {
            recorder.push(format!("text:{}", event.text_body().unwrap_or_default()));
            futures_util::future::ready(Ok(()))
        }
    }

    fn media(
        &self,
    ) -> impl FnOnce(MessageEvent, Option<MessageEvent>) -> futures_util::future::Ready<anyhow::Result<()>>
    {
        let recorder = self.clone();
        move |media, text| {
            let caption = text
                .as_ref()
                .and_then(MessageEvent::text_body)
                .unwrap_or("<none>")
                .to_string();
            recorder.push(format!("media:{}:{caption}", media.event_id));
            futures_util::future::ready(Ok(()))
        }
    }
}

fn key() -> AggregationKey {
    AggregationKey::new(ROOM, ALICE)
}

fn text(id: &str, body: &str) -> MessageEvent {
    MessageEvent::text(id, ROOM, ALICE, body)
}

fn image(id: &str) -> MessageEvent {
    MessageEvent::image(
        id,
        ROOM,
        ALICE,
        MediaInfo {
            url: format!("mxc://example.org/{id}"),
            mime_type: Some("image/png".to_string()),
            file_name: Some("photo.png".to_string()),
            size: Some(1024),
        },
    )
}

fn file(id: &str) -> MessageEvent {
    MessageEvent::file(
        id,
        ROOM,
        ALICE,
        MediaInfo {
            url: format!("mxc://example.org/{id}"),
            mime_type: Some("application/pdf".to_string()),
            file_name: Some("report.pdf".to_string()),
            size: None,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_lone_text_delivered_after_window() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();
    let started = Instant::now();

    let pending = agg.handle_text(key(), text("$t1", "Check this image"), recorder.text_only());
    assert_eq!(agg.pending_count(), 1);
    assert_eq!(agg.state(&key()), Some(AggregationState::WaitingForMedia));

    let outcome = pending.await?;

    assert_eq!(outcome, TextOutcome::DeliveredAlone);
    assert!(started.elapsed() >= WINDOW);
    assert_eq!(recorder.take(), vec!["text:Check this image"]);
    assert_eq!(agg.pending_count(), 0);
    assert_eq!(agg.state(&key()), None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_image_within_window_is_combined() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let pending = tokio::spawn(agg.handle_text(
        key(),
        text("$t1", "Check this image"),
        recorder.text_only(),
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let media_outcome = agg.handle_image(key(), image("$i1"), recorder.media()).await;

    assert_eq!(media_outcome, MediaOutcome::Combined);
    assert_eq!(pending.await??, TextOutcome::CombinedWithMedia);
    assert_eq!(agg.pending_count(), 0);

    // Well past the window: the cancelled timer must stay silent.
    tokio::time::sleep(WINDOW * 3).await;
    assert_eq!(recorder.take(), vec!["media:$i1:Check this image"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_file_within_window_is_combined() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let pending = tokio::spawn(agg.handle_text(key(), text("$t1", "the report"), recorder.text_only()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let media_outcome = agg.handle_file(key(), file("$f1"), recorder.media()).await;

    assert_eq!(media_outcome, MediaOutcome::Combined);
    assert_eq!(pending.await??, TextOutcome::CombinedWithMedia);
    assert_eq!(recorder.take(), vec!["media:$f1:the report"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_image_after_window_is_processed_alone() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let pending = tokio::spawn(agg.handle_text(
        key(),
        text("$t1", "Check this image"),
        recorder.text_only(),
    ));

    tokio::time::sleep(WINDOW + Duration::from_millis(20)).await;
    assert_eq!(pending.await??, TextOutcome::DeliveredAlone);

    let media_outcome = agg.handle_image(key(), image("$i1"), recorder.media()).await;

    assert_eq!(media_outcome, MediaOutcome::Alone);
    assert_eq!(
        recorder.take(),
        vec!["text:Check this image", "media:$i1:<none>"]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_image_without_pending_text_is_alone() {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let outcome = agg.handle_image(key(), image("$i1"), recorder.media()).await;

    assert_eq!(outcome, MediaOutcome::Alone);
    assert_eq!(recorder.take(), vec!["media:$i1:<none>"]);
}

#[tokio::test(start_paused = true)]
async fn test_second_text_supersedes_first() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let first = tokio::spawn(agg.handle_text(key(), text("$t1", "first"), recorder.text_only()));
    tokio::time::sleep(Duration::from_millis(60)).await;

    let second_started = Instant::now();
    let second = tokio::spawn(agg.handle_text(key(), text("$t2", "second"), recorder.text_only()));
    assert_eq!(agg.pending_count(), 1);

    assert_eq!(first.await??, TextOutcome::Superseded);
    assert_eq!(second.await??, TextOutcome::DeliveredAlone);

    // The second message got a fresh window rather than the remainder of the first.
    assert!(second_started.elapsed() >= WINDOW);

    let mut delivered = recorder.take();
    delivered.sort();
    assert_eq!(delivered, vec!["text:first", "text:second"]);
    assert_eq!(agg.pending_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_text_is_delivered_once() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let original = tokio::spawn(agg.handle_text(key(), text("$t1", "hello"), recorder.text_only()));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let repeat = agg
        .handle_text(key(), text("$t1", "hello"), recorder.text_only())
        .await?;

    assert_eq!(repeat, TextOutcome::Duplicate);
    assert_eq!(agg.state(&key()), Some(AggregationState::WaitingForMedia));
    assert_eq!(original.await??, TextOutcome::DeliveredAlone);

    tokio::time::sleep(WINDOW * 3).await;
    assert_eq!(recorder.take(), vec!["text:hello"]);
    assert_eq!(agg.pending_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_media_after_supersession_combines_with_newest_text() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let first = tokio::spawn(agg.handle_text(key(), text("$t1", "older"), recorder.text_only()));
    let second = tokio::spawn(agg.handle_text(key(), text("$t2", "newer"), recorder.text_only()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let media_outcome = agg.handle_image(key(), image("$i1"), recorder.media()).await;

    assert_eq!(media_outcome, MediaOutcome::Combined);
    assert_eq!(first.await??, TextOutcome::Superseded);
    assert_eq!(second.await??, TextOutcome::CombinedWithMedia);

    let mut delivered = recorder.take();
    delivered.sort();
    assert_eq!(delivered, vec!["media:$i1:newer", "text:older"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_claim_for_media_is_single_use() {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    assert!(agg.claim_for_media(&key()).is_none());

    let pending = agg.handle_text(key(), text("$t1", "hello"), recorder.text_only());

    let claimed = agg.claim_for_media(&key());
    assert_eq!(
        claimed.as_ref().and_then(MessageEvent::text_body),
        Some("hello")
    );
    assert!(agg.claim_for_media(&key()).is_none());
    assert!(!agg.claim_for_timeout(&key(), &EventId::new("$t1")));

    assert!(matches!(pending.await, Ok(TextOutcome::CombinedWithMedia)));
    assert!(recorder.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stale_timeout_cannot_finalize_successor() {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let _pending = agg.handle_text(key(), text("$t2", "current"), recorder.text_only());

    assert!(!agg.claim_for_timeout(&key(), &EventId::new("$t1")));
    assert_eq!(agg.state(&key()), Some(AggregationState::WaitingForMedia));

    assert!(agg.claim_for_timeout(&key(), &EventId::new("$t2")));
    assert_eq!(agg.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_releases_waiters_without_delivery() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let a = tokio::spawn(agg.handle_text(key(), text("$t1", "one"), recorder.text_only()));
    let b = tokio::spawn(agg.handle_text(
        AggregationKey::new(ROOM, "@bob:example.org"),
        MessageEvent::text("$t2", ROOM, "@bob:example.org", "two"),
        recorder.text_only(),
    ));
    assert_eq!(agg.pending_count(), 2);

    assert_eq!(agg.cleanup(), 2);
    assert_eq!(agg.pending_count(), 0);

    assert_eq!(a.await??, TextOutcome::Cancelled);
    assert_eq!(b.await??, TextOutcome::Cancelled);

    tokio::time::sleep(WINDOW * 3).await;
    assert!(recorder.take().is_empty());
    assert_eq!(agg.cleanup(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_keys_are_independent() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();
    let bob = AggregationKey::new(ROOM, "@bob:example.org");
    let other_room = AggregationKey::new("!other:example.org", ALICE);

    let alice_text = tokio::spawn(agg.handle_text(key(), text("$t1", "alice"), recorder.text_only()));
    let bob_text = tokio::spawn(agg.handle_text(
        bob.clone(),
        MessageEvent::text("$t2", ROOM, "@bob:example.org", "bob"),
        recorder.text_only(),
    ));
    assert_eq!(agg.pending_count(), 2);

    // Alice's upload in another room must not steal her text here.
    let outcome = agg
        .handle_image(other_room, image("$i1"), recorder.media())
        .await;
    assert_eq!(outcome, MediaOutcome::Alone);

    let outcome = agg.handle_image(bob, image("$i2"), recorder.media()).await;
    assert_eq!(outcome, MediaOutcome::Combined);

    assert_eq!(alice_text.await??, TextOutcome::DeliveredAlone);
    assert_eq!(bob_text.await??, TextOutcome::CombinedWithMedia);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timeout_callback_error_propagates() {
    let agg = MessageAggregator::new(WINDOW);

    let result = agg
        .handle_text(key(), text("$t1", "boom"), |_| async {
            Err::<(), _>(anyhow::anyhow!("agent unavailable"))
        })
        .await;

    let Err(err) = result else {
        panic!("expected callback error");
    };
    assert!(err.to_string().contains("agent unavailable"));
    assert_eq!(agg.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_callback_error_is_isolated() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let first = tokio::spawn(agg.handle_text(key(), text("$t1", "first"), |_| async {
        Err::<(), _>(anyhow::anyhow!("delivery failed"))
    }));
    let second = tokio::spawn(agg.handle_text(key(), text("$t2", "second"), recorder.text_only()));

    assert_eq!(first.await??, TextOutcome::Superseded);
    assert_eq!(second.await??, TextOutcome::DeliveredAlone);
    assert_eq!(recorder.take(), vec!["text:second"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_media_handler_error_is_swallowed() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    let pending = tokio::spawn(agg.handle_text(key(), text("$t1", "caption"), recorder.text_only()));
    let outcome = agg
        .handle_image(key(), image("$i1"), |_, _| async {
            Err::<(), _>(anyhow::anyhow!("upload rejected"))
        })
        .await;

    assert_eq!(outcome, MediaOutcome::Combined);
    assert_eq!(pending.await??, TextOutcome::CombinedWithMedia);
    assert!(recorder.take().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropped_waiter_still_gets_text_delivered() {
    let agg = MessageAggregator::new(WINDOW);
    let recorder = Recorder::default();

    drop(agg.handle_text(key(), text("$t1", "orphan"), recorder.text_only()));
    assert_eq!(agg.pending_count(), 1);

    tokio::time::sleep(WINDOW * 2).await;
    assert_eq!(agg.pending_count(), 0);
    assert_eq!(recorder.take(), vec!["text:orphan"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_media_claims_have_one_winner() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(Duration::from_secs(60));
    let recorder = Recorder::default();
    let pending = tokio::spawn(agg.handle_text(key(), text("$t1", "contended"), recorder.text_only()));

    let barrier = Arc::new(tokio::sync::Barrier::new(16));
    let mut claims = Vec::new();
    for _ in 0..16 {
        let agg = agg.clone();
        let barrier = barrier.clone();
        claims.push(tokio::spawn(async move {
            barrier.wait().await;
            agg.claim_for_media(&key()).is_some()
        }));
    }

    let mut winners = 0;
    for claim in claims {
        if claim.await? {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(pending.await??, TextOutcome::CombinedWithMedia);
    assert!(recorder.take().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_and_media_race_finalizes_once() -> anyhow::Result<()> {
    let agg = MessageAggregator::new(Duration::from_millis(1));

    for round in 0..200u64 {
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        let id = format!("$t{round}");

        let pending = tokio::spawn(agg.handle_text(key(), text(&id, "race"), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }));

        tokio::time::sleep(Duration::from_micros((round % 4) * 400)).await;
        let combined = agg.claim_for_media(&key()).is_some();
        let outcome = pending.await??;

        let alone = delivered.load(Ordering::SeqCst);
        if combined {
            assert_eq!(outcome, TextOutcome::CombinedWithMedia, "round {round}");
            assert_eq!(alone, 0, "round {round}");
        } else {
            assert_eq!(outcome, TextOutcome::DeliveredAlone, "round {round}");
            assert_eq!(alone, 1, "round {round}");
        }
        assert_eq!(agg.pending_count(), 0, "round {round}");
    }
    Ok(())
}
