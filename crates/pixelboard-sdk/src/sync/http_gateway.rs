//! HTTP 远端网关 - 行级 REST 接口（PostgREST 风格）
//!
//! - upsert：`POST {base}/{table}`，`Prefer: resolution=merge-duplicates`
//! - 删除：`DELETE {base}/{table}?id=in.(a,b,c)`
//! - 拉取：`GET {base}/{table}?workspace_id=eq.{id}`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode, Url};
use tracing::{debug, info};

use crate::config::{HttpClientConfig, PixelboardConfig};
use crate::error::{PixelboardError, Result};
use crate::storage::entities::{EntityKind, EntityRecord};
use crate::sync::gateway::RemoteGateway;

/// 单次 DELETE 的 id 上限，避免 URL 过长
const DELETE_CHUNK: usize = 100;

/// 实体类型对应的远端表
pub fn remote_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Workspace => "projects",
        EntityKind::CanvasBoard => "artboards",
        EntityKind::ReferenceLayer => "references",
        EntityKind::BackgroundImage => "background_images",
        EntityKind::LayerOrder => "layer_order",
    }
}

pub struct HttpRemoteGateway {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    access_token: Option<String>,
}

impl HttpRemoteGateway {
    pub fn new(
        base_url: impl Into<String>,
        http: &HttpClientConfig,
        api_key: Option<String>,
        access_token: Option<String>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = http.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = http.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| PixelboardError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|e| PixelboardError::Config(format!("api_base_url 不合法 {}: {}", base_url, e)))?;

        info!("HTTP 远端网关已创建: {}", base_url);
        Ok(Self { client, base_url, api_key, access_token })
    }

    pub fn from_config(config: &PixelboardConfig) -> Result<Self> {
        Self::new(
            config.api_base_url.clone(),
            &config.http,
            config.api_key.clone(),
            config.access_token.clone(),
        )
    }

    fn table_url(&self, kind: EntityKind) -> Result<Url> {
        let raw = format!("{}/{}", self.base_url, remote_table(kind));
        Url::parse(&raw).map_err(|e| PixelboardError::Config(format!("URL 不合法 {}: {}", raw, e)))
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            headers.insert("apikey", header_value(key)?);
        }
        if let Some(token) = self.access_token.as_ref().or(self.api_key.as_ref()) {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
        }
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| PixelboardError::Config(format!("请求头不合法: {}", e)))
}

/// 非 2xx 状态映射为错误
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PixelboardError::Unauthorized(body)),
        _ => Err(PixelboardError::Remote { status: status.as_u16(), message: body }),
    }
}

#[async_trait]
impl RemoteGateway for HttpRemoteGateway {
    async fn bulk_upsert(&self, kind: EntityKind, records: Vec<EntityRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut headers = self.headers()?;
        headers.insert(
            "Prefer",
            HeaderValue::from_static("resolution=merge-duplicates,return=minimal"),
        );
        let response = self
            .client
            .post(self.table_url(kind)?)
            .headers(headers)
            .json(&records)
            .send()
            .await?;
        check_status(response).await?;
        debug!("远端 upsert {}: {} 条", remote_table(kind), records.len());
        Ok(())
    }

    async fn bulk_delete(&self, kind: EntityKind, ids: Vec<String>) -> Result<()> {
        for chunk in ids.chunks(DELETE_CHUNK) {
            let mut url = self.table_url(kind)?;
            url.query_pairs_mut()
                .append_pair("id", &format!("in.({})", chunk.join(",")));
            let response = self
                .client
                .delete(url)
                .headers(self.headers()?)
                .send()
                .await?;
            check_status(response).await?;
        }
        debug!("远端删除 {}: {} 条", remote_table(kind), ids.len());
        Ok(())
    }

    async fn list(&self, kind: EntityKind, workspace_id: &str) -> Result<Vec<EntityRecord>> {
        let mut url = self.table_url(kind)?;
        let filter_column = if kind == EntityKind::Workspace { "id" } else { "workspace_id" };
        url.query_pairs_mut()
            .append_pair(filter_column, &format!("eq.{}", workspace_id))
            .append_pair("select", "*");

        let response = self.client.get(url).headers(self.headers()?).send().await?;
        let rows: Vec<serde_json::Value> = check_status(response).await?.json().await?;
        rows.into_iter()
            .map(|row| EntityRecord::from_json(kind, row))
            .collect()
    }
}
