//! Integration tests for the folio-search crate.
//!
//! A raw [`TcpListener`] plays the provider: each accepted connection gets
//! the next scripted reply, so the real `reqwest` streaming path (chunked
//! bodies, early EOF, error statuses) is exercised end to end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use folio_search::{Answer, PipelineConfig, PipelineEvent, Priority, Query, SearchError, SearchPipeline};

// ═══════════════════════════════════════════════════════════════════════
//  Scripted provider
// ═══════════════════════════════════════════════════════════════════════

enum Reply {
    /// 200 with these `data:` payloads, each followed by a pause.
    Stream { frames: Vec<String>, pause: Duration },
    /// 200, then the connection closes before `[DONE]`.
    Truncated(Vec<String>),
    /// A non-200 status.
    Status(u16, &'static str),
}

struct Provider {
    base_url: String,
    requests: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
}

fn delta(content: &str) -> String {
    serde_json::json!({ "choices": [{ "delta": { "content": content } }] }).to_string()
}

fn delta_with_citations(content: &str, citations: serde_json::Value) -> String {
    serde_json::json!({
        "choices": [{ "delta": { "content": content } }],
        "citations": citations,
    })
    .to_string()
}

fn streamed(frames: Vec<String>) -> Reply {
    Reply::Stream {
        frames,
        pause: Duration::ZERO,
    }
}

async fn spawn_provider(replies: Vec<Reply>) -> Provider {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let replies = Arc::new(Mutex::new(VecDeque::from(replies)));
    let requests = Arc::new(AtomicUsize::new(0));
    let bodies = Arc::new(Mutex::new(Vec::new()));

    let (req_count, seen) = (Arc::clone(&requests), Arc::clone(&bodies));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            req_count.fetch_add(1, Ordering::SeqCst);
            let reply = replies.lock().unwrap().pop_front();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                serve(stream, reply, seen).await;
            });
        }
    });

    Provider {
        base_url: format!("http://{addr}"),
        requests,
        bodies,
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        let text = String::from_utf8_lossy(&buf);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                return String::from_utf8_lossy(&buf[header_end + 4..]).into_owned();
            }
        }
    }
    String::new()
}

async fn serve(mut stream: TcpStream, reply: Option<Reply>, seen: Arc<Mutex<Vec<String>>>) {
    let body = read_request(&mut stream).await;
    seen.lock().unwrap().push(body);

    const SSE_HEAD: &str =
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";

    match reply {
        Some(Reply::Stream { frames, pause }) => {
            let _ = stream.write_all(SSE_HEAD.as_bytes()).await;
            for frame in frames {
                let _ = stream.write_all(format!("data: {frame}\n\n").as_bytes()).await;
                let _ = stream.flush().await;
                if !pause.is_zero() {
                    tokio::time::sleep(pause).await;
                }
            }
            let _ = stream.write_all(b"data: [DONE]\n\n").await;
        }
        Some(Reply::Truncated(frames)) => {
            let _ = stream.write_all(SSE_HEAD.as_bytes()).await;
            for frame in frames {
                let _ = stream.write_all(format!("data: {frame}\n\n").as_bytes()).await;
            }
        }
        Some(Reply::Status(code, text)) => {
            let resp = format!(
                "HTTP/1.1 {code} Error\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{text}",
                text.len()
            );
            let _ = stream.write_all(resp.as_bytes()).await;
        }
        None => {
            let resp = "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
            let _ = stream.write_all(resp.as_bytes()).await;
        }
    }
    let _ = stream.shutdown().await;
}

fn config_for(provider: &Provider) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.provider.base_url = provider.base_url.clone();
    config.provider.request_timeout_secs = 5;
    config.cache.persist = false;
    config.retry.base_delay_ms = 10;
    config.batcher.interval_ms = 10;
    config.batcher.max_latency_ms = 40;
    config
}

async fn collect(pipeline: &SearchPipeline, query: Query) -> Vec<Result<Answer, SearchError>> {
    pipeline.stream_query(query).collect().await
}

// ═══════════════════════════════════════════════════════════════════════
//  Streaming
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stream_yields_partials_then_final_answer() {
    let provider = spawn_provider(vec![Reply::Stream {
        frames: vec![
            delta("Paul"),
            delta(" is the heir"),
            delta_with_citations(
                " of House Atreides.",
                serde_json::json!([
                    "https://en.wikipedia.org/wiki/Paul_Atreides",
                    { "text": "House Atreides", "url": "https://dune.fandom.com/wiki/House_Atreides" },
                ]),
            ),
        ],
        pause: Duration::from_millis(60),
    }])
    .await;
    let pipeline = SearchPipeline::open(config_for(&provider), "test-key").await.unwrap();

    let items = collect(&pipeline, Query::new("who is Paul?").with_context("Dune")).await;
    let answers: Vec<Answer> = items.into_iter().map(Result::unwrap).collect();

    let (last, partials) = answers.split_last().unwrap();
    assert!(last.is_final);
    assert!(!last.cached);
    assert_eq!(last.text, "Paul is the heir of House Atreides.");
    assert_eq!(last.model, "sonar");
    assert!(!partials.is_empty(), "expected batched partial answers");
    for partial in partials {
        assert!(!partial.is_final);
        assert!(last.text.starts_with(&partial.text));
    }

    // "House Atreides" is anchored at its offset; the bare URL falls back to 0.
    let positions: Vec<usize> = last.citations.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 20]);
    assert!(last.confidence > 0.0 && last.confidence <= 1.0);

    let body: serde_json::Value =
        serde_json::from_str(&provider.bodies.lock().unwrap()[0]).unwrap();
    assert_eq!(body["stream"], true);
    assert_eq!(body["return_citations"], true);
    assert!(body["messages"][0]["content"].as_str().unwrap().contains("Dune"));
}

#[tokio::test]
async fn final_text_is_concatenation_of_all_frames() {
    let frames: Vec<String> = (0..200).map(|i| delta(&format!("w{i} "))).collect();
    let expected: String = (0..200).map(|i| format!("w{i} ")).collect();
    let provider = spawn_provider(vec![streamed(frames)]).await;
    let pipeline = SearchPipeline::open(config_for(&provider), "test-key").await.unwrap();

    let answer = pipeline.ask("list the words", None).await.unwrap();
    assert_eq!(answer.text, expected);
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let provider = spawn_provider(vec![streamed(vec![
        delta("Arrakis"),
        "{not json".into(),
        r#"{"choices":[{"delta":{"content":17}}]}"#.into(),
        delta(" is a desert."),
    ])])
    .await;
    let pipeline = SearchPipeline::open(config_for(&provider), "test-key").await.unwrap();

    let answer = pipeline.ask("what is Arrakis", None).await.unwrap();
    assert_eq!(answer.text, "Arrakis is a desert.");
    assert!(answer.citations.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Failures and reconnection
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn non_200_is_fatal_and_not_retried() {
    let provider = spawn_provider(vec![Reply::Status(429, "slow down")]).await;
    let pipeline = SearchPipeline::open(config_for(&provider), "test-key").await.unwrap();

    let err = pipeline.ask("what is this", None).await.unwrap_err();
    match err {
        SearchError::InvalidResponse { status, body } => {
            assert_eq!(status, 429);
            assert_eq!(body, "slow down");
        }
        other => panic!("expected InvalidResponse, got {other:?}"),
    }
    assert_eq!(provider.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dropped_stream_is_restarted_from_scratch() {
    let provider = spawn_provider(vec![
        Reply::Truncated(vec![delta("stale partial text")]),
        streamed(vec![delta("fresh "), delta("answer")]),
    ])
    .await;
    let pipeline = SearchPipeline::open(config_for(&provider), "test-key").await.unwrap();
    let mut events = pipeline.subscribe();

    let answer = pipeline.ask("what is this", None).await.unwrap();
    assert_eq!(answer.text, "fresh answer");
    assert_eq!(provider.requests.load(Ordering::SeqCst), 2);

    let mut retried = false;
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::QueryRetrying { attempt, delay_ms, .. } = event.as_ref() {
            assert_eq!(*attempt, 1);
            assert_eq!(*delay_ms, 20);
            retried = true;
        }
    }
    assert!(retried);
}

#[tokio::test]
async fn repeated_drops_exhaust_retries() {
    let provider = spawn_provider(
        (0..4)
            .map(|_| Reply::Truncated(vec![delta("partial")]))
            .collect(),
    )
    .await;
    let pipeline = SearchPipeline::open(config_for(&provider), "test-key").await.unwrap();

    let err = pipeline.ask("what is this", None).await.unwrap_err();
    assert!(
        matches!(err, SearchError::ExhaustedRetries { attempts: 4, .. }),
        "got {err:?}"
    );
    assert_eq!(provider.requests.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn slow_consumer_does_not_trigger_a_retry() {
    let frames: Vec<String> = (0..80).map(|i| delta(&format!("t{i} "))).collect();
    let expected: String = (0..80).map(|i| format!("t{i} ")).collect();
    let provider = spawn_provider(vec![Reply::Stream {
        frames,
        pause: Duration::from_millis(15),
    }])
    .await;
    let mut config = config_for(&provider);
    config.provider.request_timeout_secs = 2;
    let pipeline = SearchPipeline::open(config, "test-key").await.unwrap();
    let mut events = pipeline.subscribe();

    let stream = pipeline.stream("stream many tokens", None);
    // Stop reading for longer than the request timeout.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let answers: Vec<Answer> = stream.map(Result::unwrap).collect().await;

    let last = answers.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.text, expected);
    assert_eq!(answers.iter().filter(|a| a.is_final).count(), 1);
    assert_eq!(provider.requests.load(Ordering::SeqCst), 1);

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event.as_ref(), PipelineEvent::QueryRetrying { .. }),
            "unexpected retry: {event:?}"
        );
    }
}

#[tokio::test]
async fn dropping_the_stream_cancels_the_query() {
    let provider = spawn_provider(vec![Reply::Stream {
        frames: (0..50).map(|i| delta(&format!("{i} "))).collect(),
        pause: Duration::from_millis(50),
    }])
    .await;
    let pipeline = SearchPipeline::open(config_for(&provider), "test-key").await.unwrap();

    let mut stream = pipeline.stream("count slowly", None);
    let first = stream.next().await.unwrap().unwrap();
    assert!(!first.is_final);
    drop(stream);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pipeline.cache_stats().size, 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Cache
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_identical_query_is_served_from_cache() {
    let provider = spawn_provider(vec![streamed(vec![delta("Spice.")])]).await;
    let pipeline = SearchPipeline::open(config_for(&provider), "test-key").await.unwrap();

    let first = pipeline.ask("What is the spice?", Some("Dune")).await.unwrap();
    assert!(!first.cached);
    let second = pipeline.ask("what is  the spice?", Some("Dune")).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.text, first.text);

    assert_eq!(provider.requests.load(Ordering::SeqCst), 1);
    let stats = pipeline.cache_stats();
    assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));

    pipeline.clear_cache().await.unwrap();
    assert_eq!(pipeline.cache_stats().size, 0);
}

#[tokio::test]
async fn cached_answers_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let provider = spawn_provider(vec![streamed(vec![delta_with_citations(
        "Frank Herbert wrote Dune.",
        serde_json::json!(["https://www.britannica.com/biography/Frank-Herbert"]),
    )])])
    .await;

    let mut config = config_for(&provider);
    config.cache.persist = true;
    config.cache.path = dir.path().join("cache.db");

    let original = {
        let pipeline = SearchPipeline::open(config.clone(), "test-key").await.unwrap();
        pipeline.ask("who wrote Dune", None).await.unwrap()
    };

    let reopened = SearchPipeline::open(config, "test-key").await.unwrap();
    assert_eq!(reopened.cache_stats().size, 1);
    let cached = reopened.ask("who wrote Dune", None).await.unwrap();
    assert!(cached.cached);
    assert_eq!(cached.text, original.text);
    assert_eq!(cached.citations, original.citations);
    assert_eq!(provider.requests.load(Ordering::SeqCst), 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Rate limiting
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn throttled_query_waits_in_queue() {
    let provider = spawn_provider(vec![
        streamed(vec![delta("first")]),
        streamed(vec![delta("second")]),
    ])
    .await;
    let mut config = config_for(&provider);
    config.rate_limit.capacity = 1;
    config.rate_limit.window_secs = 1;
    let pipeline = SearchPipeline::open(config, "test-key").await.unwrap();
    let mut events = pipeline.subscribe();

    let first = pipeline.ask("first question", None).await.unwrap();
    assert_eq!(first.text, "first");

    let started = tokio::time::Instant::now();
    let second = pipeline
        .stream_query(Query::new("second question").with_priority(Priority::Interactive))
        .final_answer()
        .await
        .unwrap();
    assert_eq!(second.text, "second");
    assert!(started.elapsed() >= Duration::from_millis(500));

    let mut queued = false;
    while let Ok(event) = events.try_recv() {
        queued |= matches!(event.as_ref(), PipelineEvent::QueryQueued { depth: 1, .. });
    }
    assert!(queued);
    assert_eq!(pipeline.queue_depth(), 0);
}
