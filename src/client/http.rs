//! reqwest-backed implementation of [`IcsdService`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{
    AUTH_TOKEN_HEADER, BASE_RECORD_FIELDS, CONNECT_TIMEOUT_SECS, DEFAULT_BASE_URL,
    READ_TIMEOUT_SECS, SEARCH_TIMEOUT_SECS,
};
use super::error::ClientError;
use super::response::{parse_id_list, parse_tabular, split_cif_records};
use super::{
    ContentType, IcsdService, SearchKind, StructureMode, StructurePayload, TabularFragment,
};
use crate::auth::{AuthToken, Credential};
use crate::batch::RecordId;

/// User-Agent sent with every request.
const USER_AGENT: &str = concat!("icsd-downloader/", env!("CARGO_PKG_VERSION"));

/// Connection settings for [`IcsdClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Service root; a trailing slash is added when missing.
    pub base_url: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout for data calls.
    pub read_timeout: Duration,
    /// Whole-request timeout for search calls.
    pub search_timeout: Duration,
    /// Value of the `windowsclient` flag (CRLF line endings in exports).
    pub windows_client: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            search_timeout: Duration::from_secs(SEARCH_TIMEOUT_SECS),
            windows_client: false,
        }
    }
}

/// HTTP client for the ICSD web service.
///
/// Cheap to clone; clones share one connection pool.
///
/// # Example
///
/// ```no_run
/// use icsd_core::auth::Credential;
/// use icsd_core::client::{ClientOptions, IcsdClient, IcsdService};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = IcsdClient::new(ClientOptions::default())?;
/// let token = client.login(&Credential::new("id", "secret")).await?;
/// client.logout(&token).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct IcsdClient {
    client: Client,
    base_url: Url,
    search_timeout: Duration,
    windows_client: bool,
}

impl IcsdClient {
    /// Creates a client for the service at `options.base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] for an unparseable base URL and
    /// [`ClientError::Build`] if the reqwest client cannot be built.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let mut raw = options.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw).map_err(|_| ClientError::invalid_url(raw.clone()))?;

        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.read_timeout)
            .gzip(true)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| ClientError::Build { source })?;

        debug!(base_url = %base_url, "created ICSD client");

        Ok(Self {
            client,
            base_url,
            search_timeout: options.search_timeout,
            windows_client: options.windows_client,
        })
    }

    /// Returns the service root every endpoint is resolved against.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|_| ClientError::invalid_url(format!("{}{path}", self.base_url)))
    }

    fn windows_client_flag(&self) -> String {
        self.windows_client.to_string()
    }

    fn authorized_get(&self, url: &Url, token: &AuthToken, accept: &str) -> RequestBuilder {
        self.client
            .get(url.clone())
            .header(ACCEPT, accept)
            .header(AUTH_TOKEN_HEADER, token.as_str())
    }

    /// Sends a request and turns every non-2xx status into a [`ClientError`].
    async fn send(&self, request: RequestBuilder, url: &Url) -> Result<Response, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::network(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::http_status(url.as_str(), status.as_u16()));
        }
        Ok(response)
    }

    async fn body_text(response: Response, url: &Url) -> Result<String, ClientError> {
        response
            .text()
            .await
            .map_err(|e| ClientError::network(url.as_str(), e))
    }
}

/// Builds the repeated `idnum` query pairs for one batch.
fn id_params(ids: &[RecordId]) -> Vec<(&'static str, String)> {
    ids.iter()
        .map(|id| ("idnum", id.as_str().to_string()))
        .collect()
}

/// Column selection for a tabular export: the base columns, then extras not already present.
fn list_selection(extra_fields: &[String]) -> Vec<String> {
    let mut fields: Vec<String> = BASE_RECORD_FIELDS.iter().map(|f| (*f).to_string()).collect();
    for field in extra_fields {
        if !fields.iter().any(|f| f == field) {
            fields.push(field.clone());
        }
    }
    fields
}

#[async_trait]
impl IcsdService for IcsdClient {
    #[instrument(skip(self, credential), fields(login_id = credential.login_id()))]
    async fn login(&self, credential: &Credential) -> Result<AuthToken, ClientError> {
        let url = self.endpoint("auth/login")?;
        let request = self
            .client
            .post(url.clone())
            .header(ACCEPT, "text/plain")
            .form(&[
                ("loginid", credential.login_id()),
                ("password", credential.password()),
            ]);

        let response = self.send(request, &url).await?;
        let token = response
            .headers()
            .get(AUTH_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(AuthToken::new)
            .ok_or_else(|| {
                ClientError::malformed(url.as_str(), format!("missing {AUTH_TOKEN_HEADER} header"))
            })?;

        debug!(%token, "login accepted");
        Ok(token)
    }

    #[instrument(skip(self), fields(token = %token))]
    async fn logout(&self, token: &AuthToken) -> Result<(), ClientError> {
        let url = self.endpoint("auth/logout")?;
        let request = self.authorized_get(&url, token, "text/plain");
        let response = self.send(request, &url).await?;
        debug!(status = response.status().as_u16(), "logout acknowledged");
        Ok(())
    }

    #[instrument(skip(self, token), fields(kind = ?kind))]
    async fn search(
        &self,
        token: &AuthToken,
        query: &str,
        kind: SearchKind,
        content_type: ContentType,
    ) -> Result<Vec<RecordId>, ClientError> {
        let url = self.endpoint(kind.path())?;
        let request = self
            .authorized_get(&url, token, "application/xml")
            .query(&[("query", query), ("content type", content_type.as_str())])
            .timeout(self.search_timeout);

        let response = self.send(request, &url).await?;
        let body = Self::body_text(response, &url).await?;
        let ids = parse_id_list(url.as_str(), &body)?;
        debug!(count = ids.len(), "search returned ids");
        Ok(ids)
    }

    #[instrument(skip(self, token, ids, extra_fields), fields(ids = ids.len()))]
    async fn fetch_records(
        &self,
        token: &AuthToken,
        ids: &[RecordId],
        extra_fields: &[String],
    ) -> Result<TabularFragment, ClientError> {
        let url = self.endpoint("csv")?;
        let mut params = id_params(ids);
        params.push(("windowsclient", self.windows_client_flag()));
        params.extend(
            list_selection(extra_fields)
                .into_iter()
                .map(|field| ("listSelection", field)),
        );

        let request = self
            .authorized_get(&url, token, "application/csv")
            .query(&params);
        let response = self.send(request, &url).await?;
        let body = Self::body_text(response, &url).await?;
        parse_tabular(url.as_str(), &body)
    }

    #[instrument(skip(self, token, ids), fields(ids = ids.len()))]
    async fn fetch_structure_files(
        &self,
        token: &AuthToken,
        ids: &[RecordId],
        mode: &StructureMode,
    ) -> Result<StructurePayload, ClientError> {
        let url = self.endpoint("cif/multiple")?;
        let mut params = id_params(ids);
        params.push(("celltype", "experimental".to_string()));
        params.push(("windowsclient", self.windows_client_flag()));
        match mode {
            StructureMode::Archive { filename } => {
                params.push(("filename", filename.clone()));
                params.push(("filetype", "zip".to_string()));
            }
            StructureMode::Text => params.push(("filetype", "cif".to_string())),
        }

        let request = self
            .authorized_get(&url, token, "application/cif")
            .query(&params);
        let response = self.send(request, &url).await?;

        match mode {
            StructureMode::Archive { .. } => {
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| ClientError::network(url.as_str(), e))?;
                if bytes.is_empty() {
                    return Err(ClientError::malformed(url.as_str(), "empty archive body"));
                }
                Ok(StructurePayload::Archive(bytes.to_vec()))
            }
            StructureMode::Text => {
                let body = Self::body_text(response, &url).await?;
                Ok(StructurePayload::Records(split_cif_records(
                    url.as_str(),
                    &body,
                )?))
            }
        }
    }

    #[instrument(skip(self, token), fields(id = %id))]
    async fn fetch_structure(
        &self,
        token: &AuthToken,
        id: &RecordId,
    ) -> Result<String, ClientError> {
        let url = self.endpoint(id.as_str())?;
        let request = self
            .authorized_get(&url, token, "application/cif")
            .query(&[
                ("celltype", "experimental".to_string()),
                ("windowsclient", self.windows_client_flag()),
            ]);
        let response = self.send(request, &url).await?;
        Ok(Self::body_text(response, &url).await?.trim().to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_adds_trailing_slash() {
        let client = IcsdClient::new(ClientOptions {
            base_url: "https://icsd.example/ws".to_string(),
            ..ClientOptions::default()
        })
        .unwrap();
        assert_eq!(client.base_url().as_str(), "https://icsd.example/ws/");
        assert_eq!(
            client.endpoint("auth/login").unwrap().as_str(),
            "https://icsd.example/ws/auth/login"
        );
    }

    #[test]
    fn test_new_rejects_invalid_base_url() {
        let result = IcsdClient::new(ClientOptions {
            base_url: "not a url".to_string(),
            ..ClientOptions::default()
        });
        assert!(matches!(result, Err(ClientError::InvalidUrl { .. })));
    }

    #[test]
    fn test_list_selection_starts_with_base_fields_without_duplicates() {
        let fields = list_selection(&["ChemicalName".to_string(), "SumFormula".to_string()]);
        assert_eq!(
            fields,
            vec!["CollectionCode", "SumFormula", "StructuredFormula", "ChemicalName"]
        );
    }

    #[test]
    fn test_id_params_repeat_idnum() {
        let params = id_params(&[RecordId::from("1"), RecordId::from("2")]);
        assert_eq!(
            params,
            vec![("idnum", "1".to_string()), ("idnum", "2".to_string())]
        );
    }
}
