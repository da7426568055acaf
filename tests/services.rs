use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use url::Url;

use govner::model::HttpNerModel;
use govner::{
    write_records, Destination, Entity, EntityModel, ObjectStore, OutputRecord, PipelineError,
};

/// A request as seen by the loopback server.
#[derive(Debug, Clone)]
struct Captured {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

/// Serves `responses.len()` connections, one request each, answering in order.
fn serve<F>(responses: usize, respond: F) -> (Url, mpsc::Receiver<Captured>, JoinHandle<()>)
where
    F: Fn(usize, &Captured) -> (u16, String) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    let (sender, receiver) = mpsc::channel();
    let handle = thread::spawn(move || {
        for attempt in 0..responses {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&stream);
            let (status, body) = respond(attempt, &request);
            sender.send(request).unwrap();
            write!(
                stream,
                "HTTP/1.1 {status} Fixture\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            )
            .unwrap();
            stream.flush().unwrap();
        }
    });
    (url, receiver, handle)
}

fn read_request(stream: &TcpStream) -> Captured {
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap().to_string();
    let path = parts.next().unwrap().to_string();

    let mut headers = BTreeMap::new();
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).unwrap();
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        let (name, value) = header.split_once(':').unwrap();
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    let mut body = Vec::new();
    if let Some(length) = headers.get("content-length") {
        body.resize(length.parse().unwrap(), 0);
        reader.read_exact(&mut body).unwrap();
    } else if headers.get("transfer-encoding").map(String::as_str) == Some("chunked") {
        loop {
            let mut size_line = String::new();
            reader.read_line(&mut size_line).unwrap();
            let size_hex = size_line.trim().split(';').next().unwrap();
            let size = usize::from_str_radix(size_hex, 16).unwrap();
            let mut chunk = vec![0; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            if size == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    Captured {
        method,
        path,
        headers,
        body,
    }
}

fn predictions_for(request: &Captured) -> String {
    let payload: Value = serde_json::from_slice(&request.body).unwrap();
    let predictions: Vec<Value> = payload["instances"]
        .as_array()
        .unwrap()
        .iter()
        .map(|instance| {
            let content = instance["content"].as_str().unwrap();
            let entities: Vec<Value> = content
                .find("UK")
                .map(|start| {
                    vec![json!({
                        "text": "UK",
                        "entity_type": "GPE",
                        "entity_startchar": start.to_string(),
                        "entity_endchar": start + 2,
                    })]
                })
                .unwrap_or_default();
            json!({"post_url": instance["post_url"], "entities": entities})
        })
        .collect();
    json!({ "predictions": predictions }).to_string()
}

#[test]
fn ner_service_is_retried_after_unavailable() {
    let (url, requests, server) = serve(2, |attempt, request| {
        if attempt == 0 {
            (503, "{\"error\": \"warming up\"}".to_string())
        } else {
            (200, predictions_for(request))
        }
    });
    let endpoint = url.join("ner-service").unwrap();
    let mut model = HttpNerModel::new(endpoint, Duration::from_secs(10), 3).unwrap();

    let spans = model.extract(&["The UK and Spain", ""]).unwrap();
    assert_eq!(spans, vec![vec![Entity::new("UK", "GPE", 4, 6)], Vec::new()]);
    server.join().unwrap();

    let seen: Vec<Captured> = requests.try_iter().collect();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].method, "POST");
    assert_eq!(seen[1].path, "/ner-service");
    let sent: Value = serde_json::from_slice(&seen[1].body).unwrap();
    assert_eq!(
        sent,
        json!({"instances": [
            {"post_url": "0", "content": "The UK and Spain"},
            {"post_url": "1", "content": ""}
        ]})
    );
}

#[test]
fn ner_service_with_missing_predictions_is_a_model_error() {
    let (url, _requests, server) = serve(1, |_, _| {
        (200, "{\"predictions\": [{\"post_url\": \"0\", \"entities\": []}]}".to_string())
    });
    let mut model = HttpNerModel::new(url, Duration::from_secs(10), 1).unwrap();
    let err = model.extract(&["one", "two"]).unwrap_err();
    server.join().unwrap();
    assert!(matches!(err, PipelineError::Model(_)), "{err:?}");
}

fn sample_records() -> Vec<OutputRecord> {
    vec![
        OutputRecord {
            page_id: "/a".into(),
            entities: vec![Entity::new("Llywodraeth Cymru", "ORG", 0, 17)],
            line_number: Some(1),
        },
        OutputRecord {
            page_id: "/b".into(),
            entities: Vec::new(),
            line_number: Some(2),
        },
    ]
}

#[test]
fn object_sink_streams_one_put() {
    let (url, requests, server) = serve(1, |_, _| (200, "{}".to_string()));
    let store = ObjectStore::new(
        url.join("storage").unwrap(),
        "govuk-ner",
        Some("token-123".into()),
        Duration::from_secs(5),
    )
    .unwrap();
    let destination = Destination::Object {
        store,
        name: "content_ner/entities_200722_text_0.jsonl".into(),
    };

    let written = write_records(&destination, sample_records().into_iter().map(Ok)).unwrap();
    server.join().unwrap();
    assert_eq!(written, 2);

    let request = requests.recv().unwrap();
    assert_eq!(request.method, "PUT");
    assert_eq!(
        request.path,
        "/storage/govuk-ner/content_ner/entities_200722_text_0.jsonl"
    );
    assert_eq!(
        request.headers.get("authorization").map(String::as_str),
        Some("Bearer token-123")
    );
    assert_eq!(
        String::from_utf8(request.body).unwrap(),
        concat!(
            "{\"page_id\": \"/a\", \"entities\": [{\"name\": \"Llywodraeth Cymru\", \"type\": \"ORG\", \"start\": 0, \"end\": 17}], \"line_number\": 1}\n",
            "{\"page_id\": \"/b\", \"entities\": [], \"line_number\": 2}\n",
        )
    );
}

#[test]
fn rejected_upload_is_a_sink_error() {
    let (url, _requests, server) = serve(1, |_, _| (403, "{\"error\": \"denied\"}".to_string()));
    let store = ObjectStore::new(url, "govuk-ner", None, Duration::from_secs(5)).unwrap();
    let destination = Destination::Object {
        store,
        name: "entities.jsonl".into(),
    };
    let err = write_records(&destination, sample_records().into_iter().map(Ok)).unwrap_err();
    server.join().unwrap();
    match err {
        PipelineError::SinkWrite { reason, .. } => assert!(reason.contains("403"), "{reason}"),
        other => panic!("expected sink error, got {other:?}"),
    }
}

/// Accepts at most one connection and returns every byte the client sent before hanging up.
fn capture_raw() -> (Url, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    let handle = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Err(_) => return Vec::new(),
            }
        };
        stream.set_nonblocking(false).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
            }
        }
        received
    });
    (url, handle)
}

#[test]
fn failed_chunk_never_completes_its_upload() {
    let (url, server) = capture_raw();
    let store = ObjectStore::new(url, "govuk-ner", None, Duration::from_secs(5)).unwrap();
    let destination = Destination::Object {
        store,
        name: "content_ner/entities_200722_title_1.jsonl".into(),
    };
    let records = (0..3000)
        .map(|i| {
            Ok(OutputRecord {
                page_id: format!("/guidance/page-{i}"),
                entities: Vec::new(),
                line_number: None,
            })
        })
        .chain(std::iter::once(Err(PipelineError::malformed("/broken", "bad"))));

    let err = write_records(&destination, records).unwrap_err();
    assert!(matches!(err, PipelineError::MalformedUnit { .. }), "{err:?}");

    let received = server.join().unwrap();
    let body = received
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|end| &received[end + 4..])
        .unwrap_or_default();
    assert!(
        !body.ends_with(b"\r\n0\r\n\r\n") && body != b"0\r\n\r\n",
        "upload body was terminated: {} bytes",
        body.len()
    );
}
