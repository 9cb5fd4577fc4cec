use anyhow::{Context, Result, bail};
use gandalf_storage::{ProviderRecord, RouteRecord, RouteTarget};

/// `name=kind,base_url[,api_key]`
pub fn parse_provider(spec: &str) -> Result<ProviderRecord> {
    let (name, rest) = spec
        .split_once('=')
        .with_context(|| format!("provider spec missing '=': {spec}"))?;
    let mut parts = rest.splitn(3, ',');
    let kind = parts.next().unwrap_or_default().trim();
    let base_url = parts.next().unwrap_or_default().trim();
    let api_key = parts.next().map(|k| k.trim().to_string()).filter(|k| !k.is_empty());
    if name.trim().is_empty() || kind.is_empty() || base_url.is_empty() {
        bail!("provider spec needs name=kind,base_url: {spec}");
    }
    Ok(ProviderRecord {
        name: name.trim().to_string(),
        kind: kind.to_string(),
        base_url: base_url.to_string(),
        api_key,
        enabled: true,
    })
}

/// `alias=provider:upstream_model[:priority][;provider:model[:priority]...]`
pub fn parse_route(spec: &str) -> Result<RouteRecord> {
    let (alias, rest) = spec
        .split_once('=')
        .with_context(|| format!("route spec missing '=': {spec}"))?;
    let mut targets = Vec::new();
    for (index, target) in rest.split(';').enumerate() {
        let mut parts = target.splitn(3, ':');
        let provider = parts.next().unwrap_or_default().trim();
        let model = parts.next().unwrap_or_default().trim();
        if provider.is_empty() || model.is_empty() {
            bail!("route target needs provider:model: {target}");
        }
        let priority = match parts.next() {
            Some(p) => p
                .trim()
                .parse::<u32>()
                .with_context(|| format!("bad priority in {target}"))?,
            None => (index + 1) as u32,
        };
        targets.push(RouteTarget {
            provider_id: provider.to_string(),
            upstream_model: model.to_string(),
            priority,
        });
    }
    if targets.is_empty() {
        bail!("route spec has no targets: {spec}");
    }
    Ok(RouteRecord {
        alias: alias.trim().to_string(),
        targets,
        cache_ttl_secs: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_spec_round_trip() {
        let record =
            parse_provider("openai=openai,https://api.openai.com,sk-test").unwrap();
        assert_eq!(record.name, "openai");
        assert_eq!(record.kind, "openai");
        assert_eq!(record.api_key.as_deref(), Some("sk-test"));

        let local = parse_provider("ollama=ollama,http://127.0.0.1:11434").unwrap();
        assert!(local.api_key.is_none());

        assert!(parse_provider("bad-spec").is_err());
    }

    #[test]
    fn route_spec_round_trip() {
        let route = parse_route("gpt-4o=openai:gpt-4o:1;azure:gpt4o-deploy:2").unwrap();
        assert_eq!(route.alias, "gpt-4o");
        assert_eq!(route.targets.len(), 2);
        assert_eq!(route.targets[1].provider_id, "azure");
        assert_eq!(route.targets[1].priority, 2);

        // Priorities default to list order.
        let route = parse_route("m=one:a;two:b").unwrap();
        assert_eq!(route.targets[0].priority, 1);
        assert_eq!(route.targets[1].priority, 2);

        assert!(parse_route("m=").is_err());
    }
}
