use std::sync::Arc;

use gandalf_common::{Error, ErrorKind, Result};
use gandalf_protocol::openai::{
    ChatCompletionRequest, EmbeddingsRequest, ModelEntry, ModelList,
};
use gandalf_providers::{ChatResponse, ChunkStream, Provider, ProviderCtx, ProviderRegistry};
use gandalf_storage::RouteStore;

use crate::breaker::{BreakerRegistry, error_weight};
use crate::metrics::GatewayMetrics;
use crate::router::RouteResolver;

/// Runs the failover loop over resolved targets, applying the circuit
/// breaker and error classification. This is the only place that retries.
pub struct ProxyService<S: ?Sized> {
    router: Arc<RouteResolver<S>>,
    registry: Arc<ProviderRegistry>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<GatewayMetrics>,
}

impl<S: RouteStore + ?Sized> ProxyService<S> {
    pub fn new(
        router: Arc<RouteResolver<S>>,
        registry: Arc<ProviderRegistry>,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            router,
            registry,
            breakers,
            metrics,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn router(&self) -> &RouteResolver<S> {
        &self.router
    }

    /// Walk priority-ordered targets until one succeeds or a terminal error
    /// surfaces. Client errors (upstream 4xx or caller-fault kinds) stop
    /// the walk; everything else moves to the next target.
    async fn failover<T>(
        &self,
        alias: &str,
        mut call: impl AsyncFnMut(Arc<dyn Provider>, String) -> Result<T>,
    ) -> Result<(T, String)> {
        let route = self.router.resolve(alias).await?;
        let mut last_err: Option<Error> = None;

        for target in &route.targets {
            let Some(provider) = self.registry.get(&target.provider_id) else {
                last_err = Some(Error::new(
                    ErrorKind::Provider,
                    format!("provider {} not registered", target.provider_id),
                ));
                continue;
            };
            let breaker = self.breakers.get(&target.provider_id);
            if !breaker.allow() {
                last_err = Some(Error::new(
                    ErrorKind::Provider,
                    format!("circuit open for {}", target.provider_id),
                ));
                continue;
            }

            let timer = self.metrics.upstream_latency_seconds.start_timer();
            let result = call(provider, target.upstream_model.clone()).await;
            timer.observe_duration();

            match result {
                Ok(value) => {
                    breaker.record_success();
                    return Ok((value, target.provider_id.clone()));
                }
                Err(err) => {
                    let opened = breaker.record_error(error_weight(Some(&err)));
                    if opened {
                        self.metrics
                            .breaker_opened_total
                            .with_label_values(&[target.provider_id.as_str()])
                            .inc();
                        tracing::warn!(provider = %target.provider_id, "circuit opened");
                    }
                    self.metrics
                        .upstream_errors_total
                        .with_label_values(&[target.provider_id.as_str()])
                        .inc();
                    tracing::warn!(
                        provider = %target.provider_id,
                        error = %err,
                        "upstream call failed"
                    );
                    if err.is_client_error() {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::new(ErrorKind::Provider, "no targets available")))
    }

    pub async fn chat(
        &self,
        ctx: &ProviderCtx,
        req: &ChatCompletionRequest,
    ) -> Result<(ChatResponse, String)> {
        self.failover(&req.model, async |provider, upstream_model| {
            // Scoped model swap: the clone carries the upstream name, the
            // caller's request keeps the alias.
            let mut upstream_req = req.clone();
            upstream_req.model = upstream_model;
            provider.chat(ctx, &upstream_req).await
        })
        .await
    }

    pub async fn chat_stream(
        &self,
        ctx: &ProviderCtx,
        req: &ChatCompletionRequest,
    ) -> Result<(ChunkStream, String)> {
        self.failover(&req.model, async |provider, upstream_model| {
            let mut upstream_req = req.clone();
            upstream_req.model = upstream_model;
            provider.chat_stream(ctx, &upstream_req).await
        })
        .await
    }

    pub async fn embeddings(
        &self,
        ctx: &ProviderCtx,
        req: &EmbeddingsRequest,
    ) -> Result<(ChatResponse, String)> {
        self.failover(&req.model, async |provider, upstream_model| {
            let mut upstream_req = req.clone();
            upstream_req.model = upstream_model;
            provider.embeddings(ctx, &upstream_req).await
        })
        .await
    }

    /// Fan out across all registered providers, silently skipping the ones
    /// that fail; the concatenated list may contain duplicates.
    pub async fn list_models(&self, ctx: &ProviderCtx) -> ModelList {
        let mut entries: Vec<ModelEntry> = Vec::new();
        for provider in self.registry.all() {
            match provider.list_models(ctx).await {
                Ok(models) => entries.extend(models),
                Err(err) => {
                    tracing::debug!(
                        provider = %provider.name(),
                        error = %err,
                        "model list skipped"
                    );
                }
            }
        }
        ModelList::new(entries)
    }
}
