//! Tracker coherence across relocation and destruction.

use std::sync::Arc;
use std::thread;

use tokensync::sync::{RwMutex, RwSpinLock};
use tokensync::test_utils::init_test_logging;
use tokensync::track::{Trackable, TrackedGuarded, TrackerAnchor};
use tokensync::{assert_with_log, test_complete, test_phase};

struct Message {
    text: String,
    anchor: TrackerAnchor<Message, RwMutex>,
}

impl Message {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            anchor: TrackerAnchor::new(),
        }
    }
}

impl Trackable<RwMutex> for Message {
    fn anchor(&self) -> &TrackerAnchor<Self, RwMutex> {
        &self.anchor
    }
    fn anchor_mut(&mut self) -> &mut TrackerAnchor<Self, RwMutex> {
        &mut self.anchor
    }
}

struct SpinMessage {
    text: String,
    anchor: TrackerAnchor<SpinMessage, RwSpinLock>,
}

impl Trackable<RwSpinLock> for SpinMessage {
    fn anchor(&self) -> &TrackerAnchor<Self, RwSpinLock> {
        &self.anchor
    }
    fn anchor_mut(&mut self) -> &mut TrackerAnchor<Self, RwSpinLock> {
        &mut self.anchor
    }
}

#[test]
fn weak_handle_reads_after_move() {
    // Wrap a value, take a weak tracker handle, relocate the value, and
    // read through the upgraded handle: the new storage and new mutex
    // must serve the read.
    init_test_logging();
    test_phase!("weak_handle_reads_after_move");

    let message = TrackedGuarded::new(Message::new("hello"));
    let weak = message.tracker_weak();

    let message = TrackedGuarded::relocate(message);

    let tracker = weak.upgrade().expect("tracker outlives the move");
    let token = tracker.tracked_read().expect("value is live");
    assert_with_log!(token.text == "hello", "text after move", "hello", token.text.as_str());
    drop(token);
    drop(message);

    // With the wrapper gone, the tracker reports the value as gone.
    assert_with_log!(tracker.is_gone(), "gone after drop", true, tracker.is_gone());
    let dead = tracker.tracked_read().is_none();
    assert_with_log!(dead, "no token after drop", true, dead);
    test_complete!("weak_handle_reads_after_move");
}

#[test]
fn writes_through_tracker_land_in_relocated_value() {
    init_test_logging();
    test_phase!("writes_through_tracker_land_in_relocated_value");

    let message = TrackedGuarded::new(Message::new("v1"));
    let tracker = message.tracker();

    let message = TrackedGuarded::relocate(message);
    {
        let mut token = tracker.tracked_write().expect("live after move");
        token.text = "v2".to_owned();
    }
    let direct = message.read();
    assert_with_log!(direct.text == "v2", "write visible directly", "v2", direct.text.as_str());
    drop(direct);
    test_complete!("writes_through_tracker_land_in_relocated_value");
}

#[test]
fn concurrent_tracker_readers_survive_relocations() {
    // Readers hammer the tracker while the owner relocates the value
    // repeatedly; every successful read must see a coherent value.
    init_test_logging();
    test_phase!("concurrent_tracker_readers_survive_relocations");

    let mut holder = TrackedGuarded::new(SpinMessage {
        text: "constant".to_owned(),
        anchor: TrackerAnchor::new(),
    });
    let tracker = holder.tracker();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..3 {
        let tracker = Arc::clone(&tracker);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            let mut reads = 0u64;
            while !stop.load(std::sync::atomic::Ordering::Acquire) {
                if let Some(token) = tracker.tracked_read() {
                    assert_eq!(token.text, "constant", "torn read through tracker");
                    reads += 1;
                }
            }
            reads
        }));
    }

    for _ in 0..100 {
        holder = TrackedGuarded::relocate(holder);
        thread::yield_now();
    }
    stop.store(true, std::sync::atomic::Ordering::Release);

    let mut total_reads = 0;
    for reader in readers {
        total_reads += reader.join().unwrap();
    }
    assert_with_log!(total_reads > 0, "readers made progress", true, total_reads > 0);
    drop(holder);
    assert_with_log!(tracker.is_gone(), "terminal gone", true, tracker.is_gone());
    test_complete!("concurrent_tracker_readers_survive_relocations");
}
