//! HTTP transfers against an in-process loopback server.

mod support;

use curlev::mime::{Content, Part};
use curlev::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use support::{HttpServer, Reply};

fn engine() -> Engine {
    let engine = Engine::new();
    engine.start().expect("start engine");
    engine
}

#[test]
fn test_get_with_query_parameters() {
    let server = HttpServer::start(|_, _| Reply::ok("hello").header("X-Reply", "yes"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&server.url("/search"))
        .add_query_parameters([("q", "rust curl"), ("page", "2")])
        .exec();

    assert_eq!(http.code(), Code::Status(200));
    assert_eq!(http.text(), "hello");
    assert_eq!(http.content_type(), "text/plain");
    assert_eq!(http.headers().get("x-reply"), Some("yes"));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].target, "/search?page=2&q=rust%20curl");
    assert_eq!(requests[0].header("Expect"), None);
}

#[test]
fn test_post_body_and_headers() {
    let server = HttpServer::start(|request, _| Reply::status(201, request.body.clone()));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.post(&server.url("/items"), "application/json", r#"{"id":1}"#)
        .add_headers([("X-Trace", "abc")])
        .exec();

    assert_eq!(http.code(), Code::Status(201));
    assert_eq!(http.text(), r#"{"id":1}"#);
    let request = &server.requests()[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.header("Content-Type"), Some("application/json"));
    assert_eq!(request.header("X-Trace"), Some("abc"));
}

#[test]
fn test_put_patch_delete_methods() {
    let server = HttpServer::start(|request, _| Reply::ok(request.method.clone()));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.put(&server.url("/a"), "text/plain", "x").exec();
    assert_eq!(http.text(), "PUT");
    http.patch(&server.url("/a"), "text/plain", "y").exec();
    assert_eq!(http.text(), "PATCH");
    http.delete(&server.url("/a")).exec();
    assert_eq!(http.text(), "DELETE");
    http.request("post".parse().expect("method"), &server.url("/a"))
        .exec();
    assert_eq!(http.text(), "POST");
}

#[test]
fn test_form_body_parameters() {
    let server = HttpServer::start(|request, _| Reply::ok(request.body.clone()));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.request(Method::Post, &server.url("/form"))
        .add_body_parameters([("name", "Ada Lovelace"), ("lang", "en")])
        .exec();

    assert_eq!(http.code(), Code::Status(200));
    assert_eq!(http.text(), "lang=en&name=Ada%20Lovelace");
    assert_eq!(
        server.requests()[0].header("Content-Type"),
        Some("application/x-www-form-urlencoded")
    );
}

#[test]
fn test_mime_form_post() {
    let server = HttpServer::start(|request, _| Reply::ok(request.body.clone()));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");
    let path = std::env::temp_dir().join(format!("curlev-mime-{}.txt", std::process::id()));
    std::fs::write(&path, "file contents\r\n").expect("write upload");

    http.request(Method::Post, &server.url("/upload"))
        .add_body_parameters([("ignored", "yes")])
        .add_mime_parameters([
            Part::parameter("title", "report"),
            Content::file("notes", &path)
                .content_type("text/plain")
                .filename("notes.txt")
                .into(),
        ])
        .exec();
    std::fs::remove_file(&path).expect("remove upload");

    assert_eq!(http.code(), Code::Status(200));
    let request = &server.requests()[0];
    assert_eq!(request.method, "POST");
    let content_type = request.header("Content-Type").unwrap_or_default();
    assert!(content_type.starts_with("multipart/form-data; boundary="), "{content_type}");
    let body = http.text();
    assert!(body.contains("name=\"title\"\r\n\r\nreport\r\n"));
    assert!(body.contains("name=\"notes\"; filename=\"notes.txt\""));
    assert!(body.contains("file contents\r\n"));
    assert!(!body.contains("ignored"));
}

#[test]
fn test_plain_post_after_mime_post() {
    let server = HttpServer::start(|request, _| Reply::ok(request.body.clone()));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.post(&server.url("/a"), "", "")
        .add_mime_parameters([Part::parameter("k", "v")])
        .exec();
    assert_eq!(http.code(), Code::Status(200));

    http.post(&server.url("/b"), "text/plain", "plain").exec();
    assert_eq!(http.text(), "plain");
    assert_eq!(server.requests()[1].header("Content-Type"), Some("text/plain"));
}

#[test]
fn test_missing_method_reported() {
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");
    http.exec();
    assert_eq!(http.code(), Code::Internal(Internal::Method));
}

#[test]
fn test_connection_refused_is_transfer_code() {
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");
    http.get(&format!("http://{}/", support::closed_port())).exec();
    assert_eq!(
        http.code(),
        Code::Transfer(curl_sys::CURLE_COULDNT_CONNECT)
    );
    assert!(http.code().is_transient_transfer());
}

#[test]
fn test_callback_fires_once_after_finish() {
    let server = HttpServer::start(|_, _| Reply::ok("done"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");
    let calls = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&calls);
    http.get(&server.url("/")).start_with(move |http| {
        assert_eq!(http.text(), "done");
        assert!(!http.is_running());
        seen.fetch_add(1, Ordering::SeqCst);
    });
    http.join();
    // Joiners are released before the callback completes.
    let deadline = Instant::now() + Duration::from_secs(5);
    while calls.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(http.code(), Code::Status(200));
}

#[test]
fn test_second_start_while_running_is_noop() {
    let server = HttpServer::start(|_, _| Reply::ok("slow").delayed(Duration::from_millis(300)));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&first);
    http.get(&server.url("/")).threaded_callback(false);
    http.start_with(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    assert!(http.is_running());
    assert_eq!(http.code(), Code::Running);

    let seen = Arc::clone(&second);
    http.start_with(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    http.join();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
    assert_eq!(server.hits(), 1);
    assert_ne!(http.code(), Code::Running);
}

#[test]
fn test_abort_running_transfer() {
    let server = HttpServer::start(|_, _| Reply::ok("late").delayed(Duration::from_secs(3)));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");
    let codes = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let seen = Arc::clone(&codes);
    http.get(&server.url("/")).start_with(move |http| {
        seen.lock().push(http.code());
    });
    std::thread::sleep(Duration::from_millis(100));
    http.abort().join();

    assert!(!http.is_running());
    assert!(http.code().is_aborted());
    let deadline = Instant::now() + Duration::from_secs(5);
    while codes.lock().is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*codes.lock(), vec![Code::ABORTED]);

    // Aborting a settled transfer does nothing.
    http.abort();
    assert!(http.code().is_aborted());
}

#[test]
fn test_retry_until_server_appears() {
    let addr = support::closed_port();
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&format!("http://{addr}/"))
        .set_retries(20, Duration::from_millis(50));
    http.start();
    std::thread::sleep(Duration::from_millis(120));
    let server = HttpServer::start_on(addr, |_, _| Reply::ok("up"));
    http.join();

    assert_eq!(http.code(), Code::Status(200));
    assert_eq!(http.text(), "up");
    assert_eq!(server.hits(), 1);
}

#[test]
fn test_retry_on_503_keeps_final_attempt_only() {
    let server = HttpServer::start(|_, index| match index {
        0 => Reply::status(503, "busy busy busy").header("X-Attempt", "first"),
        _ => Reply::ok("ready"),
    });
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&server.url("/"))
        .set_retries(3, Duration::from_millis(20))
        .exec();

    assert_eq!(http.code(), Code::Status(200));
    assert_eq!(http.text(), "ready");
    assert_eq!(http.headers().get("X-Attempt"), None);
    assert_eq!(server.hits(), 2);
}

#[test]
fn test_retry_budget_exhausted() {
    let server = HttpServer::start(|_, _| Reply::status(429, "slow down"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&server.url("/"))
        .set_retries(2, Duration::from_millis(10))
        .exec();

    assert_eq!(http.code(), Code::Status(429));
    assert_eq!(server.hits(), 3);
}

#[test]
fn test_not_found_is_not_retried() {
    let server = HttpServer::start(|_, _| Reply::status(404, "missing"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&server.url("/"))
        .set_retries(5, Duration::from_millis(10))
        .exec();

    assert_eq!(http.code(), Code::Status(404));
    assert_eq!(server.hits(), 1);
}

#[test]
fn test_max_response_size_fails_transfer() {
    let server = HttpServer::start(|_, _| Reply::ok(vec![b'x'; 4096]));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&server.url("/")).max_response_size(1024).exec();
    assert_eq!(http.code(), Code::Transfer(curl_sys::CURLE_WRITE_ERROR));

    http.get(&server.url("/")).max_response_size(8192).exec();
    assert_eq!(http.code(), Code::Status(200));
    assert_eq!(http.body_bytes().len(), 4096);
}

#[test]
fn test_callback_panic_sets_crash_flags() {
    let server = HttpServer::start(|_, _| Reply::ok("fine"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");
    assert!(!engine.protocol_crashed());

    http.get(&server.url("/")).start_with(|_| panic!("application bug"));
    let deadline = Instant::now() + Duration::from_secs(5);
    while http.code() != Code::Internal(Internal::CallbackCrashed) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(http.code(), Code::Internal(Internal::CallbackCrashed));
    assert!(engine.protocol_crashed());

    // The engine keeps serving.
    http.get(&server.url("/")).exec();
    assert_eq!(http.code(), Code::Status(200));
}

#[test]
fn test_rejected_options_block_start() {
    let server = HttpServer::start(|_, _| Reply::ok("never"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&server.url("/")).options("timeout=soon").exec();
    assert_eq!(http.code(), Code::Internal(Internal::Options));
    assert_eq!(server.hits(), 0);

    http.get(&server.url("/")).exec();
    assert_eq!(http.code(), Code::Status(200));
}

#[test]
fn test_redirect_url_reported_when_not_followed() {
    let server = HttpServer::start(|_, _| Reply::status(302, "").header("Location", "/elsewhere"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&server.url("/old")).exec();
    assert_eq!(http.code(), Code::Status(302));
    assert_eq!(http.redirect_url(), server.url("/elsewhere"));
}

#[test]
fn test_follow_location_option() {
    let server = HttpServer::start(|request, _| match request.target.as_str() {
        "/old" => Reply::status(301, "").header("Location", "/new"),
        _ => Reply::ok("moved here"),
    });
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    http.get(&server.url("/old")).options("follow_location=1").exec();
    assert_eq!(http.code(), Code::Status(200));
    assert_eq!(http.text(), "moved here");
}

#[test]
fn test_launch_resolves_with_response() {
    let server = HttpServer::start(|_, _| Reply::ok("async body"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    let outcome = pollster::block_on(http.get(&server.url("/")).launch()).expect("outcome");
    assert_eq!(outcome.code, Code::Status(200));
    assert_eq!(outcome.response.text(), "async body");
    assert_eq!(outcome.response.content_type, "text/plain");
}

#[test]
fn test_handle_reusable_once_launch_resolves() {
    let server = HttpServer::start(|request, _| Reply::ok(request.target.clone()));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    for path in ["/one", "/two", "/three"] {
        let outcome = http.get(&server.url(path)).launch().wait().expect("outcome");
        assert_eq!(outcome.response.text(), path);
    }
    assert_eq!(server.hits(), 3);
}

#[test]
fn test_launch_while_busy_resolves_none() {
    let server = HttpServer::start(|_, _| Reply::ok("slow").delayed(Duration::from_millis(200)));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    let first = http.get(&server.url("/")).launch();
    let second = http.launch();
    assert!(second.wait().is_none());
    assert_eq!(first.wait().map(|outcome| outcome.code), Some(Code::Status(200)));
}

#[test]
fn test_dropped_handle_still_completes() {
    let server = HttpServer::start(|_, _| Reply::ok("orphan").delayed(Duration::from_millis(100)));
    let engine = engine();
    let done = Arc::new(AtomicUsize::new(0));

    {
        let http = Http::create(&engine).expect("create handle");
        let seen = Arc::clone(&done);
        http.get(&server.url("/")).start_with(move |http| {
            assert_eq!(http.text(), "orphan");
            seen.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(!engine.stop(Duration::from_secs(5)));
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[cfg(feature = "json")]
#[test]
fn test_json_round_trip() {
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Item {
        id: u32,
        name: String,
    }

    let server = HttpServer::start(|request, _| {
        Reply::ok(request.body.clone()).header("X-Type", request.header("Content-Type").unwrap_or(""))
    });
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");

    let item = Item {
        id: 7,
        name: "seven".to_string(),
    };
    http.json(Method::Put, &server.url("/items/7"), &item).exec();
    assert_eq!(http.code(), Code::Status(200));
    assert_eq!(http.headers().get("x-type"), Some("application/json"));
    let echoed: Item = http.response_json().expect("decode JSON");
    assert_eq!(echoed, item);
}

#[test]
fn test_abort_right_after_start_from_another_thread() {
    let server = HttpServer::start(|_, _| Reply::ok("late").delayed(Duration::from_secs(2)));
    let engine = engine();

    for _ in 0..50 {
        let http = Http::create(&engine).expect("create handle");
        http.get(&server.url("/"));

        let starter = Arc::clone(&http);
        let worker = std::thread::spawn(move || {
            starter.start();
        });
        while !http.is_running() && !worker.is_finished() {
            std::hint::spin_loop();
        }
        http.abort().join();
        worker.join().expect("starter thread");

        assert_eq!(http.code(), Code::ABORTED);
    }
}

/// Start the configured transfer and report which thread ran its callback.
fn callback_thread(http: &Http) -> Option<String> {
    let name = Arc::new(parking_lot::Mutex::new(None));
    let seen = Arc::clone(&name);
    let (done, finished) = std::sync::mpsc::channel();
    http.start_with(move |_| {
        *seen.lock() = std::thread::current().name().map(str::to_owned);
        let _ = done.send(());
    });
    finished
        .recv_timeout(Duration::from_secs(5))
        .expect("callback fired");
    name.lock().take()
}

#[test]
fn test_callback_delivery_thread() {
    let server = HttpServer::start(|_, _| Reply::ok("where"));
    let engine = engine();
    let url = server.url("/");

    let threaded = Http::create(&engine).expect("create handle");
    threaded.get(&url);
    assert_eq!(callback_thread(&threaded).as_deref(), Some("curlev-callback"));

    let on_loop = Http::create(&engine).expect("create handle");
    on_loop.get(&url).threaded_callback(false);
    assert_eq!(callback_thread(&on_loop).as_deref(), Some("curlev-loop"));
}

#[test]
fn test_launch_leaves_delivery_mode_alone() {
    let server = HttpServer::start(|_, _| Reply::ok("mode"));
    let engine = engine();
    let http = Http::create(&engine).expect("create handle");
    let url = server.url("/");

    let outcome = http.get(&url).launch().wait().expect("outcome");
    assert_eq!(outcome.code, Code::Status(200));

    http.get(&url);
    assert_eq!(callback_thread(&http).as_deref(), Some("curlev-callback"));
}
