use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{multipart, Client, Method, Request, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::auth::SessionManager;
use crate::error::{ResponseBody, Result, SessionError};

/// One part of a multipart body
#[derive(Debug, Clone)]
pub struct MultipartField {
    pub name: String,
    pub data: Bytes,
    pub file_name: Option<String>,
    pub mime: Option<String>,
}

impl MultipartField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Bytes::from(value.into()),
            file_name: None,
            mime: None,
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            file_name: Some(file_name.into()),
            mime: None,
        }
    }
}

/// Request payload
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    None,
    Json(serde_json::Value),
    Text(String),
    /// Raw bytes; no content type is forced
    Binary(Bytes),
    /// Multipart form; the content type carries the generated boundary
    Multipart(Vec<MultipartField>),
}

impl RequestBody {
    /// Binary and multipart bodies keep their own content type
    fn wants_json_content_type(&self) -> bool {
        !matches!(self, RequestBody::Binary(_) | RequestBody::Multipart(_))
    }
}

/// Options for a single logical request
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Attach the stored bearer credential
    pub auth: bool,
    /// Renew and retry once when the server answers 401
    pub retry_on_auth_failure: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: RequestBody::None,
            auth: true,
            retry_on_auth_failure: true,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post_json(body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            body: RequestBody::Json(body),
            ..Self::default()
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn without_auth(mut self) -> Self {
        self.auth = false;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry_on_auth_failure = false;
        self
    }
}

/// HTTP client that attaches session credentials and renews them on 401
pub struct SessionHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session manager
    session: SessionManager,

    /// Base URL for relative targets
    base_url: Option<Url>,
}

impl SessionHttpClient {
    /// Create a new HTTP client
    pub fn new(
        session: SessionManager,
        base_url: Option<Url>,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()?;

        Ok(Self::with_client(client, session, base_url))
    }

    /// Create from an existing reqwest client
    pub fn with_client(client: Client, session: SessionManager, base_url: Option<Url>) -> Self {
        Self {
            client,
            session,
            base_url,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Execute a request and return its parsed body.
    ///
    /// A 401 on an authenticated request triggers one renewal; when it
    /// succeeds the request is sent again with retries disabled. Non-success
    /// responses become `SessionError::Http`.
    pub async fn execute(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<ResponseBody> {
        let url = self.resolve(target)?;
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let mut retry_on_auth_failure = options.retry_on_auth_failure;
        let mut attempt = 1;

        loop {
            let request = self.build_request(&url, &options)?;

            tracing::debug!(
                request_id = %request_id,
                method = %options.method,
                url = %url,
                attempt = attempt,
                "Sending HTTP request"
            );

            let response = self.client.execute(request).await.map_err(|e| {
                tracing::warn!(request_id = %request_id, url = %url, error = %e, "HTTP request error");
                SessionError::Network(e)
            })?;

            let status = response.status();
            tracing::debug!(request_id = %request_id, status = %status, "Received HTTP response");

            if status == StatusCode::UNAUTHORIZED && options.auth && retry_on_auth_failure {
                tracing::warn!(request_id = %request_id, "Received 401, renewing token...");

                if self.session.renew().await.is_renewed() {
                    retry_on_auth_failure = false;
                    attempt += 1;
                    continue;
                }

                tracing::warn!(request_id = %request_id, "Renewal failed, giving up on request");
            }

            return Self::finish(&request_id, response).await;
        }
    }

    /// Execute a request and deserialize its JSON body
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        target: &str,
        options: RequestOptions,
    ) -> Result<T> {
        match self.execute(target, options).await? {
            ResponseBody::Json(value) => {
                serde_json::from_value(value).map_err(|e| SessionError::Decode(e.to_string()))
            }
            ResponseBody::Text(_) => Err(SessionError::Decode("response is not JSON".into())),
            ResponseBody::Empty => Err(SessionError::Decode("response has no body".into())),
        }
    }

    fn resolve(&self, target: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(target) {
            return Ok(url);
        }

        match &self.base_url {
            Some(base) => base
                .join(target)
                .map_err(|e| SessionError::InvalidTarget(format!("{}: {}", target, e))),
            None => Err(SessionError::InvalidTarget(format!(
                "{}: relative target without a base URL",
                target
            ))),
        }
    }

    /// Build the outgoing request with the current credentials
    fn build_request(&self, url: &Url, options: &RequestOptions) -> Result<Request> {
        let headers = self.build_headers(options)?;
        let builder = self
            .client
            .request(options.method.clone(), url.clone())
            .headers(headers);

        let builder = match &options.body {
            RequestBody::None => builder,
            RequestBody::Json(value) => builder.body(serde_json::to_vec(value).map_err(|e| {
                SessionError::Internal(anyhow::anyhow!("Failed to encode JSON body: {}", e))
            })?),
            RequestBody::Text(text) => builder.body(text.clone()),
            RequestBody::Binary(data) => builder.body(data.clone()),
            RequestBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        };

        Ok(builder.build()?)
    }

    fn build_headers(&self, options: &RequestOptions) -> Result<HeaderMap> {
        let mut headers = options.headers.clone();

        match &options.body {
            RequestBody::Multipart(_) => {
                headers.remove(CONTENT_TYPE);
            }
            body if body.wants_json_content_type() && !headers.contains_key(CONTENT_TYPE) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            _ => {}
        }

        if !options.auth {
            headers.remove(AUTHORIZATION);
            return Ok(headers);
        }

        if let Some(token) = self.session.store().access_token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SessionError::InvalidHeader(format!("authorization: {}", e)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        Ok(headers)
    }

    /// Turn the final response into a body or a typed error
    async fn finish(request_id: &str, response: Response) -> Result<ResponseBody> {
        let status = response.status();

        if !status.is_success() {
            let body = match response.text().await {
                Ok(raw) => ResponseBody::parse(&raw),
                Err(_) => ResponseBody::Empty,
            };
            tracing::error!(
                request_id = %request_id,
                status = status.as_u16(),
                response_body = %body,
                "HTTP request failed with error response"
            );
            return Err(SessionError::Http {
                status: status.as_u16(),
                body,
            });
        }

        if status == StatusCode::NO_CONTENT {
            return Ok(ResponseBody::Empty);
        }

        let raw = response.text().await?;
        Ok(ResponseBody::parse(&raw))
    }
}

fn build_form(fields: &[MultipartField]) -> Result<multipart::Form> {
    let mut form = multipart::Form::new();
    for field in fields {
        let mut part = multipart::Part::bytes(field.data.to_vec());
        if let Some(file_name) = &field.file_name {
            part = part.file_name(file_name.clone());
        }
        if let Some(mime) = &field.mime {
            part = part
                .mime_str(mime)
                .map_err(|e| SessionError::InvalidHeader(format!("{}: {}", mime, e)))?;
        }
        form = form.part(field.name.clone(), part);
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialStore, IssuedTokens};

    fn test_client() -> SessionHttpClient {
        let session = SessionManager::new(
            CredentialStore::in_memory(),
            Client::new(),
            Url::parse("http://127.0.0.1:9/auth/refresh").unwrap(),
        );
        SessionHttpClient::new(
            session,
            Some(Url::parse("http://api.example.test/v1/").unwrap()),
            10,
            30,
        )
        .unwrap()
    }

    fn login(client: &SessionHttpClient) {
        client
            .session()
            .store()
            .save(IssuedTokens::new("A1", "R1", 120), None)
            .unwrap();
    }

    #[test]
    fn test_resolve_targets() {
        let client = test_client();
        assert_eq!(
            client.resolve("users").unwrap().as_str(),
            "http://api.example.test/v1/users"
        );
        assert_eq!(
            client.resolve("https://other.test/x").unwrap().as_str(),
            "https://other.test/x"
        );

        let no_base = SessionHttpClient::with_client(Client::new(), client.session().clone(), None);
        assert!(matches!(
            no_base.resolve("users"),
            Err(SessionError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_single_bearer_header() {
        let client = test_client();
        login(&client);

        let options = RequestOptions::get()
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        let headers = client.build_headers(&options).unwrap();

        let values: Vec<_> = headers.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "Bearer A1");
        assert_eq!(headers.get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_no_auth_strips_authorization() {
        let client = test_client();
        login(&client);

        let options = RequestOptions::get()
            .header(AUTHORIZATION, HeaderValue::from_static("Bearer caller"))
            .without_auth();
        let headers = client.build_headers(&options).unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_no_token_sends_unauthenticated() {
        let client = test_client();
        let headers = client.build_headers(&RequestOptions::get()).unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_caller_content_type_is_kept() {
        let client = test_client();
        let options = RequestOptions::default()
            .body(RequestBody::Text("a=b".into()))
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
        let headers = client.build_headers(&options).unwrap();
        assert_eq!(headers[CONTENT_TYPE], "application/x-www-form-urlencoded");
    }

    #[test]
    fn test_binary_body_has_no_forced_content_type() {
        let client = test_client();
        let options = RequestOptions::default().body(RequestBody::Binary(Bytes::from_static(b"\x00\x01")));
        let headers = client.build_headers(&options).unwrap();
        assert!(headers.get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_multipart_drops_caller_content_type() {
        let client = test_client();
        let options = RequestOptions::default()
            .method(Method::POST)
            .body(RequestBody::Multipart(vec![
                MultipartField::text("title", "report"),
                MultipartField::file("file", "report.csv", Bytes::from_static(b"a,b\n")),
            ]))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let headers = client.build_headers(&options).unwrap();
        assert!(headers.get(CONTENT_TYPE).is_none());

        let request = client
            .build_request(&Url::parse("http://api.example.test/upload").unwrap(), &options)
            .unwrap();
        let content_type = request.headers()[CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("multipart/form-data; boundary="));
    }
}
