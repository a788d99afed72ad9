use crate::config::ContentConfig;
use crate::error::{MangoError, Result};
use crate::models::{Credential, Envelope, PageBytes};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: &ContentConfig) -> Result<Self> {
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("MangoOffline/{}", env!("CARGO_PKG_VERSION")));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }

    fn request(&self, method: Method, url: &str, credential: Option<&Credential>) -> RequestBuilder {
        let request = self.client.request(method, url);
        match credential {
            Some(credential) => request.bearer_auth(credential.token()),
            None => request,
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        credential: Option<&Credential>,
    ) -> Result<T> {
        let response = self.request(Method::GET, url, credential).send().await?;
        let envelope: Envelope<T> = read_envelope(response).await?;
        envelope
            .data
            .ok_or_else(|| MangoError::invalid_data(format!("Response from {} has no data", url)))
    }

    /// Sends a mutation and checks the `success` flag of the reply.
    pub async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        credential: Option<&Credential>,
        body: Option<&B>,
    ) -> Result<()> {
        let mut request = self.request(method, url, credential);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let _: Envelope<serde_json::Value> = read_envelope(response).await?;
        Ok(())
    }

    pub async fn get_bytes(&self, url: &str) -> Result<PageBytes> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(MangoError::network(format!("GET {} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(rejection(status, None));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let bytes = response.bytes().await?;

        Ok(PageBytes {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

/// 5xx answers are treated like a dropped connection; 4xx and `success: false` are rejections.
async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<Envelope<T>> {
    let status = response.status();
    if status.is_server_error() {
        return Err(MangoError::network(format!("Server error {}", status)));
    }

    let text = response.text().await?;
    let envelope: Envelope<T> = match serde_json::from_str(&text) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => return Err(rejection(status, None)),
        Err(e) => return Err(e.into()),
    };

    if !status.is_success() || !envelope.success {
        return Err(rejection(status, envelope.error));
    }

    Ok(envelope)
}

fn rejection(status: StatusCode, error: Option<String>) -> MangoError {
    MangoError::rejected(error.unwrap_or_else(|| format!("status {}", status)))
}

/// Encodes page bytes as a `data:` URL so they can be stored as text and rendered directly.
pub fn encode_data_url(page: &PageBytes) -> String {
    let mime = page
        .content_type
        .as_deref()
        .filter(|ct| ct.starts_with("image/"))
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string())
        .or_else(|| sniff_mime(&page.bytes).map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());

    format!("data:{};base64,{}", mime, BASE64.encode(&page.bytes))
}

pub fn decode_data_url(data_url: &str) -> Result<Vec<u8>> {
    let (_, payload) = data_url
        .split_once(";base64,")
        .ok_or_else(|| MangoError::invalid_data("Not a base64 data URL"))?;
    BASE64
        .decode(payload)
        .map_err(|e| MangoError::invalid_data(format!("Bad base64 payload: {}", e)))
}

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    use image::ImageFormat;

    match image::guess_format(bytes).ok()? {
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Png => Some("image/png"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::Avif => Some("image/avif"),
        ImageFormat::Bmp => Some("image/bmp"),
        _ => None,
    }
}

pub fn bytes_to_mb(bytes: u64) -> u64 {
    (bytes as f64 / (1024.0 * 1024.0)).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn test_encode_uses_content_type() {
        let page = PageBytes {
            bytes: vec![1, 2, 3],
            content_type: Some("image/webp; charset=binary".into()),
        };
        assert_eq!(encode_data_url(&page), "data:image/webp;base64,AQID");
    }

    #[test]
    fn test_encode_sniffs_when_header_missing() {
        let page = PageBytes {
            bytes: PNG_HEADER.to_vec(),
            content_type: Some("application/octet-stream".into()),
        };
        assert!(encode_data_url(&page).starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_decode_round_trips_payload() {
        let page = PageBytes {
            bytes: PNG_HEADER.to_vec(),
            content_type: None,
        };
        let decoded = decode_data_url(&encode_data_url(&page)).unwrap();
        assert_eq!(decoded, PNG_HEADER);
        assert!(decode_data_url("https://not-data").is_err());
    }

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(50 * 1024 * 1024), 50);
        assert_eq!(bytes_to_mb(0), 0);
    }
}
