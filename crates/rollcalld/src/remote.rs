//! HTTP client for the remote face-match service.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::{Client, StatusCode};
use rollcall_core::{FaceMatch, Identity, MatchError, RemoteMatcher};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error code the service returns when the image contains no face.
const NO_FACE_CODE: &str = "InvalidParameter";

#[derive(Serialize)]
struct SearchRequest<'a> {
    collection_id: &'a str,
    image: String,
    threshold: f32,
    max_faces: u32,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    face_matches: Vec<FaceMatchBody>,
}

#[derive(Deserialize)]
struct FaceMatchBody {
    external_image_id: String,
    similarity: f32,
}

#[derive(Serialize)]
struct CreateCollectionRequest<'a> {
    collection_id: &'a str,
}

/// One face stored in the remote collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedFace {
    pub face_id: String,
    #[serde(rename = "external_image_id")]
    pub identity: Identity,
}

#[derive(Deserialize)]
struct FacePage {
    #[serde(default)]
    faces: Vec<IndexedFace>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Serialize)]
struct DeleteFacesRequest<'a> {
    face_ids: &'a [String],
}

#[derive(Deserialize)]
struct DeleteFacesResponse {
    #[serde(default)]
    deleted_face_ids: Vec<String>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Searches a face collection over HTTP.
pub struct HttpMatcher {
    client: Client,
    endpoint: String,
    collection_id: String,
    api_key: Option<String>,
}

impl HttpMatcher {
    pub fn new(
        endpoint: &str,
        collection_id: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("rollcalld/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            collection_id: collection_id.to_string(),
            api_key,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(StatusCode, String), MatchError> {
        let response = self.authorize(request).send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        Ok((status, body))
    }

    /// Create the collection unless it exists. Returns `true` if it was created.
    pub async fn create_collection(&self) -> Result<bool, MatchError> {
        let (status, body) = self.send(self.client.get(self.collection_url())).await?;
        if status.is_success() {
            tracing::info!(collection = %self.collection_id, "face collection already exists");
            return Ok(false);
        }
        if status != StatusCode::NOT_FOUND {
            return Err(status_error(status, &body));
        }

        let request = CreateCollectionRequest {
            collection_id: &self.collection_id,
        };
        let url = format!("{}/collections", self.endpoint);
        let (status, body) = self.send(self.client.post(&url).json(&request)).await?;
        let created = parse_create(status, &body)?;
        if created {
            tracing::info!(collection = %self.collection_id, "face collection created");
        }
        Ok(created)
    }

    /// Every face in the collection, following pagination.
    pub async fn list_faces(&self) -> Result<Vec<IndexedFace>, MatchError> {
        let url = format!("{}/faces", self.collection_url());
        let mut faces = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut request = self.client.get(&url);
            if let Some(token) = &next_token {
                request = request.query(&[("next_token", token)]);
            }
            let (status, body) = self.send(request).await?;
            let page = parse_faces(status, &body)?;
            faces.extend(page.faces);
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }
        tracing::debug!(count = faces.len(), "listed faces");
        Ok(faces)
    }

    /// Delete faces by id. Returns how many the service reports deleted.
    pub async fn delete_faces(&self, face_ids: &[String]) -> Result<usize, MatchError> {
        if face_ids.is_empty() {
            return Ok(0);
        }
        let url = format!("{}/faces", self.collection_url());
        let request = DeleteFacesRequest { face_ids };
        let (status, body) = self.send(self.client.delete(&url).json(&request)).await?;
        let deleted = parse_delete(status, &body)?;
        tracing::info!(requested = face_ids.len(), deleted, "deleted faces");
        Ok(deleted)
    }

    /// Delete every face in the collection. Returns how many were deleted.
    pub async fn clear_faces(&self) -> Result<usize, MatchError> {
        let ids: Vec<String> = self
            .list_faces()
            .await?
            .into_iter()
            .map(|face| face.face_id)
            .collect();
        self.delete_faces(&ids).await
    }
}

#[async_trait]
impl RemoteMatcher for HttpMatcher {
    async fn search(
        &self,
        image_jpeg: &[u8],
        threshold: f32,
        max_faces: u32,
    ) -> Result<Vec<FaceMatch>, MatchError> {
        let request = SearchRequest {
            collection_id: &self.collection_id,
            image: BASE64.encode(image_jpeg),
            threshold,
            max_faces,
        };
        let url = format!("{}/search", self.collection_url());

        tracing::debug!(bytes = image_jpeg.len(), "sending search request");
        let (status, body) = self.send(self.client.post(&url).json(&request)).await?;
        parse_search(status, &body)
    }

    async fn check(&self) -> Result<(), MatchError> {
        let (status, body) = self.send(self.client.get(self.collection_url())).await?;
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(MatchError::Permanent(format!(
                "collection {:?} does not exist",
                self.collection_id
            )));
        }
        Err(status_error(status, &body))
    }
}

fn transport_error(e: reqwest::Error) -> MatchError {
    MatchError::Transient(e.to_string())
}

/// Turn a search response into candidates.
///
/// A "no face in image" rejection is an empty result, not an error.
fn parse_search(status: StatusCode, body: &str) -> Result<Vec<FaceMatch>, MatchError> {
    if status.is_success() {
        let parsed: SearchResponse = serde_json::from_str(body)
            .map_err(|e| MatchError::Permanent(format!("malformed search response: {e}")))?;
        return Ok(parsed
            .face_matches
            .into_iter()
            .map(|m| FaceMatch {
                identity: Identity::from(m.external_image_id),
                similarity: m.similarity,
            })
            .collect());
    }

    if status == StatusCode::BAD_REQUEST {
        let error: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        if error.code == NO_FACE_CODE {
            return Ok(Vec::new());
        }
    }
    Err(status_error(status, body))
}

/// `true` when created, `false` when the service says it already exists.
fn parse_create(status: StatusCode, body: &str) -> Result<bool, MatchError> {
    if status.is_success() {
        return Ok(true);
    }
    if status == StatusCode::CONFLICT {
        return Ok(false);
    }
    Err(status_error(status, body))
}

fn parse_faces(status: StatusCode, body: &str) -> Result<FacePage, MatchError> {
    if !status.is_success() {
        return Err(status_error(status, body));
    }
    serde_json::from_str(body)
        .map_err(|e| MatchError::Permanent(format!("malformed face list: {e}")))
}

fn parse_delete(status: StatusCode, body: &str) -> Result<usize, MatchError> {
    if !status.is_success() {
        return Err(status_error(status, body));
    }
    let parsed: DeleteFacesResponse = serde_json::from_str(body)
        .map_err(|e| MatchError::Permanent(format!("malformed delete response: {e}")))?;
    Ok(parsed.deleted_face_ids.len())
}

fn status_error(status: StatusCode, body: &str) -> MatchError {
    let detail = match serde_json::from_str::<ErrorBody>(body) {
        Ok(e) if !e.message.is_empty() => format!("{status}: {} ({})", e.message, e.code),
        _ => format!("{status}: {}", body.chars().take(200).collect::<String>()),
    };
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        MatchError::Transient(detail)
    } else {
        MatchError::Permanent(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches() {
        let body = r#"{"face_matches":[
            {"external_image_id":"Ana_Silva","similarity":92.5},
            {"external_image_id":"Bob","similarity":86.0}
        ]}"#;
        let matches = parse_search(StatusCode::OK, body).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].identity, Identity::from("Ana_Silva"));
        assert_eq!(matches[0].similarity, 92.5);
    }

    #[test]
    fn test_parse_empty_body_fields() {
        assert!(parse_search(StatusCode::OK, "{}").unwrap().is_empty());
    }

    #[test]
    fn test_no_face_is_empty_result() {
        let body = r#"{"code":"InvalidParameter","message":"no faces in image"}"#;
        assert!(parse_search(StatusCode::BAD_REQUEST, body).unwrap().is_empty());
    }

    #[test]
    fn test_other_bad_request_is_permanent() {
        let body = r#"{"code":"ImageTooLarge","message":"too big"}"#;
        let err = parse_search(StatusCode::BAD_REQUEST, body).unwrap_err();
        assert!(matches!(err, MatchError::Permanent(ref m) if m.contains("too big")));
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error(StatusCode::INTERNAL_SERVER_ERROR, "oops").is_transient());
        assert!(!status_error(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!status_error(StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn test_malformed_success_is_permanent() {
        let err = parse_search(StatusCode::OK, "<html>").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_request_shape() {
        let request = SearchRequest {
            collection_id: "classroom",
            image: BASE64.encode([0xff, 0xd8]),
            threshold: 85.0,
            max_faces: 5,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["collection_id"], "classroom");
        assert_eq!(json["image"], "/9g=");
        assert_eq!(json["max_faces"], 5);
    }

    #[test]
    fn test_endpoint_trailing_slash() {
        let matcher =
            HttpMatcher::new("http://svc:8080/", "classroom", None, Duration::from_secs(1)).unwrap();
        assert_eq!(matcher.collection_url(), "http://svc:8080/collections/classroom");
    }

    #[test]
    fn test_parse_create() {
        assert!(parse_create(StatusCode::CREATED, "{}").unwrap());
        assert!(!parse_create(StatusCode::CONFLICT, "").unwrap());
        assert!(parse_create(StatusCode::FORBIDDEN, "").is_err());
    }

    #[test]
    fn test_parse_faces_page() {
        let body = r#"{"faces":[
            {"face_id":"f-1","external_image_id":"Ana_Silva"},
            {"face_id":"f-2","external_image_id":"Bob"}
        ],"next_token":"abc"}"#;
        let page = parse_faces(StatusCode::OK, body).unwrap();
        assert_eq!(page.faces.len(), 2);
        assert_eq!(page.faces[0].face_id, "f-1");
        assert_eq!(page.faces[0].identity, Identity::from("Ana_Silva"));
        assert_eq!(page.next_token.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_faces_last_page() {
        let page = parse_faces(StatusCode::OK, r#"{"faces":[]}"#).unwrap();
        assert!(page.faces.is_empty());
        assert!(page.next_token.is_none());
    }

    #[test]
    fn test_parse_faces_missing_collection_is_permanent() {
        let err = parse_faces(StatusCode::NOT_FOUND, "").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_delete_counts() {
        let body = r#"{"deleted_face_ids":["f-1","f-2"]}"#;
        assert_eq!(parse_delete(StatusCode::OK, body).unwrap(), 2);
        assert!(parse_delete(StatusCode::SERVICE_UNAVAILABLE, "").unwrap_err().is_transient());
    }

    #[test]
    fn test_face_serializes_with_wire_names() {
        let face = IndexedFace {
            face_id: "f-1".into(),
            identity: Identity::from("Ana_Silva"),
        };
        let json = serde_json::to_value(&face).unwrap();
        assert_eq!(json["external_image_id"], "Ana_Silva");
    }

    #[tokio::test]
    async fn test_delete_nothing_skips_request() {
        let matcher =
            HttpMatcher::new("http://127.0.0.1:9", "classroom", None, Duration::from_millis(500))
                .unwrap();
        assert_eq!(matcher.delete_faces(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transient() {
        let matcher =
            HttpMatcher::new("http://127.0.0.1:9", "classroom", None, Duration::from_millis(500))
                .unwrap();
        let err = matcher.search(&[0xff, 0xd8], 85.0, 5).await.unwrap_err();
        assert!(err.is_transient());
    }
}
