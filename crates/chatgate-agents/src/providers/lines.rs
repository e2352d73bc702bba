use bytes::Bytes;
use chatgate_common::Result;
use futures::stream::{self, BoxStream, StreamExt};

use super::request_error;

/// Split a response body into lines, without trailing `\r\n`. Empty lines are kept
/// so SSE framing stays visible to callers.
pub(crate) fn byte_lines(
    provider: &'static str,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
) -> BoxStream<'static, Result<String>> {
    stream::unfold(
        (body, Vec::<u8>::new(), false),
        move |(mut body, mut buffer, mut ended)| async move {
            loop {
                if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line_bytes: Vec<u8> = buffer.drain(0..=pos).collect();
                    let line = String::from_utf8_lossy(&line_bytes)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    return Some((Ok(line), (body, buffer, ended)));
                }

                if ended {
                    if buffer.is_empty() {
                        return None;
                    }
                    let rest = String::from_utf8_lossy(&buffer)
                        .trim_end_matches('\r')
                        .to_string();
                    buffer.clear();
                    return Some((Ok(rest), (body, buffer, ended)));
                }

                match body.next().await {
                    Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        ended = true;
                        buffer.clear();
                        return Some((Err(request_error(provider, e)), (body, buffer, ended)));
                    }
                    None => ended = true,
                }
            }
        },
    )
    .boxed()
}

/// Non-empty lines only, for newline-delimited JSON bodies.
pub(crate) fn ndjson_lines(
    provider: &'static str,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
) -> BoxStream<'static, Result<String>> {
    byte_lines(provider, body)
        .filter(|line| {
            let keep = !matches!(line, Ok(l) if l.trim().is_empty());
            async move { keep }
        })
        .boxed()
}

/// The `data` payloads of a server-sent event stream. Multi-line data fields are
/// joined with `\n`; comments and other fields are dropped.
pub(crate) fn sse_data(
    provider: &'static str,
    body: BoxStream<'static, reqwest::Result<Bytes>>,
) -> BoxStream<'static, Result<String>> {
    stream::unfold(
        (byte_lines(provider, body), Vec::<String>::new()),
        |(mut lines, mut data)| async move {
            loop {
                match lines.next().await {
                    Some(Ok(line)) => {
                        if line.is_empty() {
                            if !data.is_empty() {
                                let payload = data.join("\n");
                                data.clear();
                                return Some((Ok(payload), (lines, data)));
                            }
                            continue;
                        }
                        if let Some(value) = line.strip_prefix("data:") {
                            data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                        }
                    }
                    Some(Err(e)) => return Some((Err(e), (lines, data))),
                    None => {
                        if data.is_empty() {
                            return None;
                        }
                        let payload = data.join("\n");
                        data.clear();
                        return Some((Ok(payload), (lines, data)));
                    }
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&'static str]) -> BoxStream<'static, reqwest::Result<Bytes>> {
        let chunks: Vec<reqwest::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn sse_frames_split_across_chunks() {
        let payloads: Vec<String> = sse_data(
            "test",
            body(&[
                "event: ping\ndata: {\"a\":",
                "1}\r\n\r\n: comment\n\ndata: [DONE]\n\n",
            ]),
        )
        .map(|p| p.unwrap())
        .collect()
        .await;

        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[tokio::test]
    async fn trailing_data_without_blank_line_is_flushed() {
        let payloads: Vec<String> = sse_data("test", body(&["data: last"]))
            .map(|p| p.unwrap())
            .collect()
            .await;
        assert_eq!(payloads, vec!["last".to_string()]);
    }

    #[tokio::test]
    async fn ndjson_skips_blank_lines() {
        let lines: Vec<String> = ndjson_lines("test", body(&["{\"x\":1}\n\n{\"x\"", ":2}"]))
            .map(|l| l.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["{\"x\":1}".to_string(), "{\"x\":2}".to_string()]);
    }
}
