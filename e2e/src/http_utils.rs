/// A request carrying `content` as its body. An empty `host` sends no Host
/// header at all.
pub fn http_request<S1: Into<String>, S2: Into<String>, S3: Into<String>, S4: Into<String>>(
    method: S1,
    uri: S2,
    content: S3,
    host: S4,
) -> String {
    let (method, uri, content, host) = (method.into(), uri.into(), content.into(), host.into());
    let host_header = if host.is_empty() {
        String::new()
    } else {
        format!("Host: {host}\r\n")
    };

    format!(
        "{method} {uri} HTTP/1.1\r\n{host_header}Connection: keep-alive\r\nContent-Length: {}\r\nAccept: */*\r\n\r\n{content}",
        content.len(),
    )
}

pub fn http_ok_response<S: Into<String>>(content: S) -> String {
    let content = content.into();
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{content}",
        content.len(),
    )
}

/// Value of the first `Host:` header of a raw request
pub fn host_header(request: &str) -> Option<&str> {
    request
        .split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find_map(|line| line.strip_prefix("Host:"))
        .map(str::trim)
}

/// The first line of a raw request or response
pub fn start_line(message: &str) -> Option<&str> {
    message.split("\r\n").next().filter(|line| !line.is_empty())
}
