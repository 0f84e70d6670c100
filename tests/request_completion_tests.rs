/// Request completion tests
///
/// Tests for non-blocking operations: completion, deadlines and cancellation
/// Run with: cargo test --test request_completion_tests

use mpiguard::{
    ANY_TAG, BindingError, BufferToken, Completion, HandleKind, LoopbackConfig, LoopbackRuntime,
    NativeRuntime, Session, ThreadSupportLevel,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn session(level: ThreadSupportLevel) -> Session<LoopbackRuntime> {
    let runtime = LoopbackRuntime::new(LoopbackConfig::new(4, 0).eager_limit(8)).unwrap();
    let session = Session::with_defaults(runtime).unwrap();
    session.initialize(level).unwrap();
    session
}

#[test]
fn test_zero_deadline_times_out_then_completes_once() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();

    // Larger than the eager limit, so the send waits for the remote side
    let send = session
        .isend(world, 3, 1, BufferToken::new(vec![7u8; 32]))
        .unwrap();

    let err = session.complete(send, Some(Duration::ZERO)).unwrap_err();
    assert_eq!(err, BindingError::Timeout(send));
    assert!(err.is_recoverable());
    assert_eq!(session.pending_count(), 1);
    assert!(session.ledger().is_pending(send));

    session.runtime().settle_outbound().unwrap();
    let buffer = session.complete(send, None).unwrap();
    assert_eq!(buffer.into_inner(), vec![7u8; 32]);
    assert_eq!(session.pending_count(), 0);

    assert_eq!(
        session.complete(send, None),
        Err(BindingError::AlreadyCompleted(send))
    );
}

#[test]
fn test_zero_deadline_below_multiple() {
    let session = session(ThreadSupportLevel::Funneled);
    let world = session.world().unwrap();
    let recv = session.irecv(world, 2, 0, BufferToken::zeroed(4)).unwrap();

    let started = Instant::now();
    assert_eq!(
        session.complete(recv, Some(Duration::ZERO)),
        Err(BindingError::Timeout(recv))
    );
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(session.pending_count(), 1);

    let native_world = session.handle(world).unwrap().native;
    session.runtime().inject(native_world, 2, 0, b"late").unwrap();
    assert_eq!(session.complete(recv, None).unwrap().as_slice(), b"late");
}

#[test]
fn test_bounded_wait_expires() {
    let session = session(ThreadSupportLevel::Serialized);
    let world = session.world().unwrap();
    let recv = session.irecv(world, 1, 0, BufferToken::zeroed(1)).unwrap();

    let started = Instant::now();
    let result = session.complete(recv, Some(Duration::from_millis(30)));
    assert_eq!(result, Err(BindingError::Timeout(recv)));
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert!(session.ledger().is_pending(recv));
}

#[test]
fn test_self_send_delivers_into_receive_token() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();

    let recv = session
        .irecv(world, 0, ANY_TAG, BufferToken::zeroed(16))
        .unwrap();
    let send = session
        .isend(world, 0, 42, BufferToken::from(&b"rendezvous payload"[..16]))
        .unwrap();

    let inbox = session.complete(recv, None).unwrap();
    assert_eq!(inbox.as_slice(), b"rendezvous paylo");
    assert_eq!(
        session.complete(send, None).unwrap().as_slice(),
        b"rendezvous paylo"
    );
}

#[test]
fn test_large_self_send_completes_when_received() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();
    let payload: Vec<u8> = (0..64).collect();

    let send = session
        .isend(world, 0, 3, BufferToken::new(payload.clone()))
        .unwrap();
    assert_eq!(
        session.complete(send, Some(Duration::ZERO)),
        Err(BindingError::Timeout(send))
    );

    let recv = session.irecv(world, 0, 3, BufferToken::zeroed(64)).unwrap();
    assert_eq!(session.complete(send, None).unwrap().into_inner(), payload);
    assert_eq!(session.complete(recv, None).unwrap().into_inner(), payload);
}

#[test]
fn test_cancel_pending_receive() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();
    let recv = session.irecv(world, 3, 0, BufferToken::zeroed(6)).unwrap();

    let outcome = session.cancel(recv).unwrap();
    assert_eq!(outcome, Completion::Cancelled(BufferToken::zeroed(6)));
    assert_eq!(session.pending_count(), 0);
    assert!(!session.is_live(recv));

    assert_eq!(
        session.complete(recv, None),
        Err(BindingError::AlreadyCompleted(recv))
    );
    assert_eq!(session.cancel(recv), Err(BindingError::AlreadyCompleted(recv)));
    session.finalize().unwrap();
}

#[test]
fn test_cancel_after_unobserved_completion() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();

    // Eager remote send: finished before anyone asks
    let send = session
        .isend(world, 1, 0, BufferToken::from(&b"tiny"[..]))
        .unwrap();
    let outcome = session.cancel(send).unwrap();
    assert!(!outcome.is_cancelled());
    assert_eq!(outcome.into_token().as_slice(), b"tiny");
}

#[test]
fn test_cancel_after_observed_completion() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();
    let send = session
        .isend(world, 2, 0, BufferToken::from(&b"done"[..]))
        .unwrap();
    session.complete(send, None).unwrap();

    assert_eq!(session.cancel(send), Err(BindingError::AlreadyCompleted(send)));
}

#[test]
fn test_wait_reports_cancelled_outcome() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();
    let recv = session.irecv(world, 1, 5, BufferToken::zeroed(2)).unwrap();
    let native = session.ledger().lookup(recv).unwrap();

    // Cancelled behind the ledger's back; the wait still sees it
    assert!(session.runtime().cancel(native).unwrap());
    let outcome = session.wait(recv, None).unwrap();
    assert!(outcome.is_cancelled());
}

#[test]
fn test_unknown_and_foreign_ids() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();

    assert_eq!(
        session.complete(world, None),
        Err(BindingError::UnknownRequest(world))
    );

    let group = session.comm_group(world).unwrap();
    assert!(matches!(
        session.track(group, BufferToken::zeroed(1)),
        Err(BindingError::KindMismatch {
            expected: HandleKind::Request,
            found: HandleKind::Group,
            ..
        })
    ));
}

#[test]
fn test_track_twice_rejected() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();
    let recv = session.irecv(world, 1, 0, BufferToken::zeroed(1)).unwrap();

    assert!(matches!(
        session.track(recv, BufferToken::zeroed(1)),
        Err(BindingError::DuplicateHandle(_))
    ));
    assert_eq!(session.pending_count(), 1);
}

#[test]
fn test_inject_from_another_thread_wakes_waiter() {
    let session = Arc::new(session(ThreadSupportLevel::Multiple));
    let world = session.world().unwrap();
    let native_world = session.handle(world).unwrap().native;
    let recv = session.irecv(world, 2, 8, BufferToken::zeroed(5)).unwrap();

    let sender = {
        let session = Arc::clone(&session);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            session.runtime().inject(native_world, 2, 8, b"wake!").unwrap()
        })
    };

    let inbox = session.complete(recv, Some(Duration::from_secs(5))).unwrap();
    assert!(sender.join().unwrap());
    assert_eq!(inbox.as_slice(), b"wake!");
}

#[test]
fn test_pending_requests_oldest_first() {
    let session = session(ThreadSupportLevel::Multiple);
    let world = session.world().unwrap();

    let first = session.irecv(world, 1, 0, BufferToken::zeroed(1)).unwrap();
    std::thread::sleep(Duration::from_millis(2));
    let second = session.irecv(world, 2, 0, BufferToken::zeroed(1)).unwrap();

    assert_eq!(session.ledger().pending_requests(), vec![first, second]);
    assert!(session.ledger().oldest_pending_age().is_some());
    assert!(session.stats().oldest_pending_ms.is_some());
}

#[tokio::test]
async fn test_complete_async() {
    let session = Arc::new(session(ThreadSupportLevel::Multiple));
    let world = session.world().unwrap();
    let native_world = session.handle(world).unwrap().native;
    let recv = session.irecv(world, 3, 2, BufferToken::zeroed(3)).unwrap();

    let waiter = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.complete_async(recv, None).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    session.runtime().inject(native_world, 3, 2, b"abc").unwrap();

    let inbox = waiter.await.unwrap().unwrap();
    assert_eq!(inbox.as_slice(), b"abc");
    assert_eq!(session.pending_count(), 0);
}

#[tokio::test]
async fn test_complete_async_funneled_is_rejected() {
    let session = Arc::new(session(ThreadSupportLevel::Funneled));
    let world = session.world().unwrap();
    let recv = session.irecv(world, 3, 2, BufferToken::zeroed(3)).unwrap();

    let result = session.complete_async(recv, Some(Duration::ZERO)).await;
    assert!(matches!(
        result,
        Err(BindingError::ThreadLevelViolation { .. })
    ));
    assert_eq!(session.pending_count(), 1);

    assert!(session.cancel(recv).unwrap().is_cancelled());
}
