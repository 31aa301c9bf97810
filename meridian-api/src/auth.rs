use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;
use futures::FutureExt;
use tracing::trace;

use meridian_state::RequestContext;
use meridian_store::Scope;
use meridian_util::cache::ComputeError;

use crate::{ApiError, ApiState};

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn client_ip(request: &Request, trust_proxy: bool) -> Option<IpAddr> {
    let forwarded = trust_proxy
        .then(|| request.headers().get("x-forwarded-for"))
        .flatten()
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|addr| addr.trim().parse().ok());

    forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}

/// Find what an API key may act upon, caching the answer
async fn lookup_scope(state: &ApiState, key: &str) -> Result<Option<Scope>, ApiError> {
    let store = Arc::clone(&state.store);
    let owned = key.to_owned();
    let compute = async move {
        let tx = store.read().await?;
        let api_key = tx.api_key(&owned).await?;
        Ok::<_, ComputeError>(api_key.map(|k| k.scope))
    }
    .boxed();

    let scope = state.api_keys.get_or_compute(key, compute).await?;
    Ok(scope)
}

/// Resolve the caller's API key into a [`RequestContext`] for the handlers
pub(crate) async fn authorize(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .ok_or(ApiError::MissingCredentials)?
        .to_owned();
    let scope = lookup_scope(&state, &token)
        .await?
        .ok_or(ApiError::InvalidCredentials)?;

    let mut ctx = RequestContext::new(scope);
    if let Some(ip) = client_ip(&request, state.trust_proxy) {
        ctx = ctx.with_client_ip(ip);
    }
    trace!(scope = ?ctx.scope, client_ip = ?ctx.client_ip, "authorized");

    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    #[test]
    fn it_reads_bearer_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn forwarded_addresses_need_a_trusted_proxy() {
        let mut request = Request::new(Body::empty());
        request
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("10.1.1.1, 10.0.0.2"));
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 0, 5], 4000))));

        assert_eq!(
            client_ip(&request, true),
            Some(IpAddr::from([10, 1, 1, 1]))
        );
        assert_eq!(
            client_ip(&request, false),
            Some(IpAddr::from([192, 168, 0, 5]))
        );
    }
}
