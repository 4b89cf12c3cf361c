use std::convert::Infallible;

use handlebars::Handlebars;
use serde_json::json;
use serde_jsonlines::WriteExt;

use crate::{
    CreateRequest, CreateResponse, DEFAULT_VALIDITY_MINUTES, ListResponse, MappingDetails,
    error::StoreError,
    model::AccessContext,
    store::MappingStore,
};

const NOT_FOUND_TEMPLATE: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="{{delay}};url={{fallback}}">
  <title>Link Not Found</title>
</head>
<body>
  <h1>Link Not Found</h1>
  <p>The short link <code>{{code}}</code> doesn't exist or has expired.</p>
  <p>Redirecting to <a href="{{fallback}}">{{fallback}}</a> in {{delay}} seconds...</p>
</body>
</html>
"#;

/// Where visitors of an unknown or expired code end up, and after how long.
#[derive(Clone, Debug)]
pub struct Fallback {
    pub location: String,
    pub delay_secs: u64,
}

impl Default for Fallback {
    fn default() -> Self {
        Self {
            location: "/".to_string(),
            delay_secs: 3,
        }
    }
}

/// HTTP face of the mapping store.
#[derive(Clone, Debug)]
pub struct Renderer {
    base_url: String,
    fallback: Fallback,
    store: MappingStore,
    handlebars: Handlebars<'static>,
}

fn error_reply(e: &StoreError) -> Result<Box<dyn warp::Reply>, Infallible> {
    let status = match e {
        StoreError::Validation(_) => warp::http::StatusCode::BAD_REQUEST,
        StoreError::Collision(_) => warp::http::StatusCode::CONFLICT,
        StoreError::NotFound => warp::http::StatusCode::NOT_FOUND,
        StoreError::Exhausted { .. } => warp::http::StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok(Box::new(warp::reply::with_status(
        warp::reply::json(&json!({ "error": e.to_string() })),
        status,
    )))
}

/// Referer host, or "direct" when the visitor came without one.
fn source_of(referer: Option<&str>) -> String {
    referer
        .filter(|r| !r.trim().is_empty())
        .map(|r| match url::Url::parse(r) {
            Ok(parsed) => parsed.host_str().unwrap_or(r).to_string(),
            Err(_) => r.to_string(),
        })
        .unwrap_or_else(|| "direct".to_string())
}

/// First hop of X-Forwarded-For, or "localhost".
fn origin_of(forwarded_for: Option<&str>) -> String {
    forwarded_for
        .and_then(|f| f.split(',').next())
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "localhost".to_string())
}

impl Renderer {
    pub fn new(base_url: &str, fallback: Fallback, store: MappingStore) -> Result<Self, handlebars::TemplateError> {
        let mut handlebars = Handlebars::new();
        handlebars.register_template_string("not_found", NOT_FOUND_TEMPLATE)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            fallback,
            store,
            handlebars,
        })
    }

    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    pub async fn create(&self, request: CreateRequest) -> Result<Box<dyn warp::Reply>, Infallible> {
        let validity = request.validity.unwrap_or(DEFAULT_VALIDITY_MINUTES);
        let shortcode = request.shortcode.as_deref().filter(|c| !c.is_empty());

        match self.store.create(&request.url, validity, shortcode).await {
            Ok(mapping) => {
                let response = CreateResponse::new(mapping, &self.base_url);
                Ok(Box::new(warp::reply::with_header(
                    warp::reply::with_status(warp::reply::json(&response), warp::http::StatusCode::CREATED),
                    "Location",
                    format!("/{}", &response.code),
                )))
            }
            Err(e) => error_reply(&e),
        }
    }

    pub async fn get(
        &self,
        code: &str,
        referer: Option<&str>,
        forwarded_for: Option<&str>,
    ) -> Result<Box<dyn warp::Reply>, Infallible> {
        let context = AccessContext {
            source: source_of(referer),
            origin: origin_of(forwarded_for),
        };
        match self.store.resolve_with(code, context).await {
            Ok(target) => {
                let location = url::Url::parse(&target).map(String::from).unwrap_or(target);
                match location.parse::<warp::http::Uri>() {
                    Ok(uri) => Ok(Box::new(warp::reply::with_header(
                        warp::redirect::temporary(uri),
                        "Cache-Control",
                        "no-cache",
                    ))),
                    Err(e) => {
                        tracing::error!("unredirectable target for {code}: {e}");
                        Ok(Box::new(warp::http::StatusCode::INTERNAL_SERVER_ERROR))
                    }
                }
            }
            Err(_) => self.not_found(code),
        }
    }

    fn not_found(&self, code: &str) -> Result<Box<dyn warp::Reply>, Infallible> {
        match self.handlebars.render(
            "not_found",
            &json!({"code": code, "fallback": self.fallback.location, "delay": self.fallback.delay_secs}),
        ) {
            Ok(page) => Ok(Box::new(warp::reply::with_status(
                warp::reply::html(page),
                warp::http::StatusCode::NOT_FOUND,
            ))),
            Err(e) => {
                tracing::error!("{e}");
                Ok(Box::new(warp::http::StatusCode::NOT_FOUND))
            }
        }
    }

    pub async fn all(&self) -> Result<Box<dyn warp::Reply>, Infallible> {
        let now = self.store.now();
        let details: Vec<MappingDetails> = self
            .store
            .list()
            .await
            .into_iter()
            .map(|mapping| MappingDetails::new(mapping, &self.base_url, now))
            .collect();
        Ok(Box::new(warp::reply::json(&ListResponse::new(details))))
    }

    pub async fn detail(&self, code: &str) -> Result<Box<dyn warp::Reply>, Infallible> {
        match self.store.lookup(code).await {
            Some(mapping) => {
                let details = MappingDetails::new(mapping, &self.base_url, self.store.now());
                Ok(Box::new(warp::reply::json(&details)))
            }
            None => error_reply(&StoreError::NotFound),
        }
    }

    pub async fn export(&self) -> Result<Box<dyn warp::Reply>, Infallible> {
        let mappings = self.store.list().await;
        let mut buffer: Vec<u8> = Vec::new();
        if let Err(e) = buffer.write_json_lines(&mappings) {
            tracing::error!("{e}");
            return Ok(Box::new(warp::http::StatusCode::INTERNAL_SERVER_ERROR));
        }
        match String::from_utf8(buffer) {
            Ok(body) => Ok(Box::new(warp::reply::with_header(
                body,
                "Content-Type",
                "application/x-ndjson",
            ))),
            Err(e) => {
                tracing::error!("{e}");
                Ok(Box::new(warp::http::StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }

    pub async fn health(&self) -> Result<Box<dyn warp::Reply>, Infallible> {
        let health = self.store.health();
        let status = if health.degraded {
            warp::http::StatusCode::SERVICE_UNAVAILABLE
        } else {
            warp::http::StatusCode::OK
        };
        Ok(Box::new(warp::reply::with_status(warp::reply::json(&health), status)))
    }
}
