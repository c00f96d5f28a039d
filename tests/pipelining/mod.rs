use crate::{BadFrame, EchoConn, PanickingConn, Request, Response, SyncEchoConn};
use futures_util::future::join_all;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_coalesce::blocking::Blocking;
use tokio_coalesce::pipelining::{Config, Error};
use tokio_coalesce::PipeliningConn;
use tower::{Service, ServiceExt};


const FOREVER: Duration = Duration::from_secs(3600);

type Mock = tower_test::mock::Mock<Vec<Request>, Vec<Result<Response, BadFrame>>>;

fn requests(n: usize, prefix: &str) -> Vec<Request> {
    (0..n)
        .map(|i| Request::new(i, &format!("{}-{}", prefix, i)))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn fills_batches_and_fires_timer() {
    const CONCURRENT: usize = 10;

    let conn = EchoConn::default();
    let pc = PipeliningConn::builder(conn.clone())
        .batch_size(CONCURRENT)
        .flush_period(FOREVER)
        .build();

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let submit = |req: Request| {
        let pc = pc.clone();
        let done = done_tx.clone();
        tokio::spawn(async move {
            let res = pc.submit(req.clone()).await.unwrap();
            res.check(&req);
            done.send(()).unwrap();
        });
    };

    let mut reqs = requests(CONCURRENT, "first").into_iter();
    for req in reqs.by_ref().take(CONCURRENT - 1) {
        submit(req);
    }

    // until a final request fills the batch nothing should happen
    sleep(Duration::from_millis(250)).await;
    assert!(done_rx.try_recv().is_err());
    assert_eq!(conn.exchanges(), 0);

    submit(reqs.next().unwrap());
    for _ in 0..CONCURRENT {
        timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .expect("waited too long for a response");
    }
    assert!(done_rx.try_recv().is_err());
    assert_eq!(conn.batch_sizes(), vec![CONCURRENT]);

    // only submit half a batch, but fire the timer by hand so it still gets flushed
    for req in requests(CONCURRENT / 2, "second") {
        submit(req);
    }

    // nothing should happen yet
    sleep(Duration::from_millis(250)).await;
    assert!(done_rx.try_recv().is_err());
    assert_eq!(conn.exchanges(), 1);

    pc.flush().unwrap();
    for _ in 0..CONCURRENT / 2 {
        timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .expect("waited too long for a response");
    }
    assert!(done_rx.try_recv().is_err());
    assert_eq!(conn.batch_sizes(), vec![CONCURRENT, CONCURRENT / 2]);
}

#[tokio::test(start_paused = true)]
async fn flush_period_bounds_partial_batch() {
    let conn = EchoConn::default();
    let pc = PipeliningConn::builder(conn.clone())
        .batch_size(10)
        .flush_period(Duration::from_millis(100))
        .build();

    let reqs = requests(3, "lonely");
    let handles: Vec<_> = reqs
        .iter()
        .cloned()
        .map(|req| {
            let pc = pc.clone();
            tokio::spawn(async move { pc.submit(req).await })
        })
        .collect();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(conn.exchanges(), 0);

    sleep(Duration::from_millis(100)).await;
    assert_eq!(conn.batch_sizes(), vec![3]);

    for (handle, req) in handles.into_iter().zip(&reqs) {
        handle.await.unwrap().unwrap().check(req);
    }
}

#[tokio::test(start_paused = true)]
async fn responses_go_to_their_own_callers() {
    let conn = EchoConn::default();
    let pc = PipeliningConn::builder(conn.clone())
        .batch_size(7)
        .flush_period(FOREVER)
        .build();

    let reqs = requests(35, "positional");
    let results = join_all(reqs.iter().cloned().map(|req| pc.submit(req))).await;

    assert_eq!(conn.batch_sizes(), vec![7; 5]);
    for (res, req) in results.into_iter().zip(&reqs) {
        res.unwrap().check(req);
    }
}

#[tokio::test(start_paused = true)]
async fn decode_error_only_fails_its_caller() {
    let conn = EchoConn::default();
    let pc = PipeliningConn::builder(conn.clone())
        .batch_size(3)
        .flush_period(FOREVER)
        .build();

    let reqs = vec![
        Request::new(0, "fine"),
        Request::new(1, "!garbled"),
        Request::new(2, "also fine"),
    ];
    let mut results = join_all(reqs.iter().cloned().map(|req| pc.submit(req)))
        .await
        .into_iter();

    results.next().unwrap().unwrap().check(&reqs[0]);
    match results.next().unwrap() {
        Err(Error::Decode(e)) => assert_eq!(e, BadFrame(1)),
        other => panic!("expected a decode error, got {:?}", other),
    }
    results.next().unwrap().unwrap().check(&reqs[2]);
    assert_eq!(conn.exchanges(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_exchange_reaches_every_caller() {
    let (mock, mut handle) = tower_test::mock::pair();
    let pc: PipeliningConn<Mock, Request> = PipeliningConn::builder(mock)
        .batch_size(3)
        .flush_period(FOREVER)
        .build();

    let callers = tokio::spawn({
        let pc = pc.clone();
        async move { join_all(requests(3, "doomed").into_iter().map(|req| pc.submit(req))).await }
    });

    let (sent, respond) = handle.next_request().await.unwrap();
    assert_eq!(sent, requests(3, "doomed"));
    respond.send_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));

    let errors: Vec<_> = callers
        .await
        .unwrap()
        .into_iter()
        .map(|res| match res {
            Err(Error::Exchange(e)) => e,
            other => panic!("expected an exchange error, got {:?}", other.map(|_| ())),
        })
        .collect();
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|e| Arc::ptr_eq(e, &errors[0])));
    assert_eq!(errors[0].to_string(), "reset");
}

#[tokio::test(start_paused = true)]
async fn unready_connection_fails_only_the_next_batch() {
    let (mock, mut handle) = tower_test::mock::pair();
    let pc: PipeliningConn<Mock, Request> = PipeliningConn::builder(mock)
        .batch_size(2)
        .flush_period(FOREVER)
        .build();

    handle.send_error(io::Error::new(io::ErrorKind::NotConnected, "not ready"));
    let failed = join_all(requests(2, "early").into_iter().map(|req| pc.submit(req))).await;
    for res in failed {
        assert!(res.unwrap_err().is_exchange());
    }

    let callers = tokio::spawn({
        let pc = pc.clone();
        async move { join_all(requests(2, "late").into_iter().map(|req| pc.submit(req))).await }
    });
    let (sent, respond) = handle.next_request().await.unwrap();
    respond.send_response(sent.into_iter().map(|r| Ok(Response::from(r))).collect());
    for (res, req) in callers.await.unwrap().into_iter().zip(&requests(2, "late")) {
        res.unwrap().check(req);
    }
}

#[tokio::test(start_paused = true)]
async fn wrong_response_count_desynchronizes_batch() {
    let (mock, mut handle) = tower_test::mock::pair();
    let pc: PipeliningConn<Mock, Request> = PipeliningConn::builder(mock)
        .batch_size(2)
        .flush_period(FOREVER)
        .build();

    let callers = tokio::spawn({
        let pc = pc.clone();
        async move { join_all(requests(2, "short").into_iter().map(|req| pc.submit(req))).await }
    });

    let (mut sent, respond) = handle.next_request().await.unwrap();
    sent.truncate(1);
    respond.send_response(sent.into_iter().map(|r| Ok(Response::from(r))).collect());

    for res in callers.await.unwrap() {
        assert!(matches!(res, Err(Error::Desynchronized)));
    }
}

#[tokio::test(start_paused = true)]
async fn one_exchange_in_flight_at_a_time() {
    let (mock, mut handle) = tower_test::mock::pair();
    let pc: PipeliningConn<Mock, Request> = PipeliningConn::builder(mock)
        .batch_size(2)
        .flush_period(FOREVER)
        .build();

    let submit_all = |reqs: Vec<Request>| {
        let pc = pc.clone();
        tokio::spawn(async move { join_all(reqs.into_iter().map(|req| pc.submit(req))).await })
    };

    let first = submit_all(requests(2, "first"));
    let (sent, respond_first) = handle.next_request().await.unwrap();
    assert_eq!(sent, requests(2, "first"));

    // the second batch fills up while the first is still on the wire
    let second = submit_all(requests(2, "second"));
    assert!(timeout(Duration::from_millis(100), handle.next_request())
        .await
        .is_err());

    respond_first.send_response(sent.into_iter().map(|r| Ok(Response::from(r))).collect());
    let (sent, respond_second) = handle.next_request().await.unwrap();
    assert_eq!(sent, requests(2, "second"));
    respond_second.send_response(sent.into_iter().map(|r| Ok(Response::from(r))).collect());

    for (res, req) in first.await.unwrap().into_iter().zip(&requests(2, "first")) {
        res.unwrap().check(req);
    }
    for (res, req) in second.await.unwrap().into_iter().zip(&requests(2, "second")) {
        res.unwrap().check(req);
    }
}

#[tokio::test(start_paused = true)]
async fn close_drains_then_rejects() {
    let conn = EchoConn::default();
    let pc = PipeliningConn::builder(conn.clone())
        .batch_size(10)
        .flush_period(FOREVER)
        .build();

    let reqs = requests(2, "before-close");
    let pending: Vec<_> = reqs
        .iter()
        .cloned()
        .map(|req| {
            let pc = pc.clone();
            tokio::spawn(async move { pc.submit(req).await })
        })
        .collect();
    // let the submissions reach the coordinator
    sleep(Duration::from_millis(10)).await;
    assert_eq!(conn.exchanges(), 0);

    pc.close().await.unwrap();
    assert!(pc.is_closed());
    assert_eq!(conn.batch_sizes(), vec![2]);
    // the coordinator's handle to the connection is gone
    assert_eq!(conn.handles(), 1);
    for (handle, req) in pending.into_iter().zip(&reqs) {
        handle.await.unwrap().unwrap().check(req);
    }

    let err = pc.submit(Request::new(9, "after-close")).await.unwrap_err();
    assert!(err.is_closed());
    assert!(matches!(pc.flush(), Err(Error::Closed)));
    assert!(matches!(pc.close().await, Err(Error::Closed)));
    assert_eq!(conn.exchanges(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_releases_connection() {
    let conn = EchoConn::default();
    let pc = PipeliningConn::builder(conn.clone())
        .batch_size(10)
        .flush_period(FOREVER)
        .build();

    // `call` enqueues right away, so the handle can go before the response arrives
    let req = Request::new(0, "last words");
    let pending = pc.clone().call(req.clone());
    drop(pc);

    pending.await.unwrap().check(&req);
    sleep(Duration::from_millis(1)).await;
    assert_eq!(conn.handles(), 1);
}

#[tokio::test(start_paused = true)]
async fn panicking_exchange_cancels_its_batch() {
    let pc = PipeliningConn::builder(PanickingConn)
        .batch_size(3)
        .flush_period(FOREVER)
        .build();

    let results = join_all(requests(3, "unlucky").into_iter().map(|req| pc.submit(req))).await;
    assert_eq!(results.len(), 3);
    for res in results {
        match res {
            Err(Error::Cancelled) => {}
            other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
        }
    }

    // the coordinator went down with the exchange
    assert!(pc.is_closed());
    let err = pc.submit(Request::new(9, "too late")).await.unwrap_err();
    assert!(err.is_closed());
}

#[tokio::test(start_paused = true)]
async fn serves_as_tower_service() {
    let conn = EchoConn::default();
    let pc = PipeliningConn::builder(conn.clone())
        .config(Config {
            batch_size: 1,
            flush_period: FOREVER,
        })
        .build();
    assert_eq!(pc.config().batch_size, 1);

    let req = Request::new(4, "service");
    let res = pc.clone().oneshot(req.clone()).await.unwrap();
    res.check(&req);
    assert_eq!(conn.exchanges(), 1);

    pc.close().await.unwrap();
    let err = pc.oneshot(req).await.unwrap_err();
    assert!(err.is_closed());
}

#[test]
#[should_panic(expected = "batch size must be greater than zero")]
fn zero_batch_size_is_rejected() {
    let _ = PipeliningConn::<EchoConn, Request>::builder(EchoConn::default()).batch_size(0);
}

#[tokio::test]
async fn blocking_connection_end_to_end() {
    let conn = SyncEchoConn::default();
    let exchanges = conn.counter();
    let pc = PipeliningConn::builder(Blocking::new(conn))
        .batch_size(4)
        .flush_period(Duration::from_millis(20))
        .build();

    let reqs = requests(10, "blocking");
    let results = join_all(reqs.iter().cloned().map(|req| pc.submit(req))).await;
    for (res, req) in results.into_iter().zip(&reqs) {
        res.unwrap().check(req);
    }
    // 4 + 4 by size, the last 2 by timer
    assert_eq!(exchanges.load(Ordering::SeqCst), 3);
    pc.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_callers() {
    let conn = EchoConn::default();
    let pc = PipeliningConn::builder(conn.clone())
        .batch_size(8)
        .flush_period(Duration::from_millis(1))
        .build();

    let handles: Vec<_> = requests(200, "stress")
        .into_iter()
        .map(|req| {
            let pc = pc.clone();
            tokio::spawn(async move {
                let res = pc.submit(req.clone()).await.unwrap();
                res.check(&req);
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let sizes = conn.batch_sizes();
    assert_eq!(sizes.iter().sum::<usize>(), 200);
    assert!(sizes.iter().all(|&n| n > 0 && n <= 8));
}
