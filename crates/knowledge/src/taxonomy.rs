//! Fixed topic taxonomy used to tag new documents.
//!
//! Entries are checked in declaration order and the first entry with any
//! keyword hit wins. The order is a tie-break between topics, not a ranking
//! of relevance:
//!
//! 1. `kubernetes`     — orchestration
//! 2. `monitoring`     — metrics and alerting
//! 3. `logging`        — log aggregation and queries
//! 4. `tracing`        — distributed traces
//! 5. `git`            — version control
//! 6. `infrastructure` — hosts, networks, cloud
//! 7. `security`       — access control and secrets
//!
//! Text matching nothing is `general`.

pub const GENERAL: &str = "general";

pub struct TaxonomyEntry {
    pub category: &'static str,
    pub keywords: &'static [&'static str],
}

pub const TAXONOMY: &[TaxonomyEntry] = &[
    TaxonomyEntry {
        category: "kubernetes",
        keywords: &[
            "kubernetes",
            "k8s",
            "kubectl",
            "pod",
            "pods",
            "deployment",
            "deployments",
            "namespace",
            "helm",
            "crashloopbackoff",
            "statefulset",
            "daemonset",
            "ingress",
        ],
    },
    TaxonomyEntry {
        category: "monitoring",
        keywords: &[
            "prometheus",
            "grafana",
            "metric",
            "metrics",
            "alert",
            "alerts",
            "alertmanager",
            "promql",
            "dashboard",
            "monitoring",
        ],
    },
    TaxonomyEntry {
        category: "logging",
        keywords: &[
            "loki",
            "logql",
            "log",
            "logs",
            "logging",
            "elasticsearch",
            "kibana",
            "fluentd",
        ],
    },
    TaxonomyEntry {
        category: "tracing",
        keywords: &[
            "jaeger",
            "tempo",
            "trace",
            "traces",
            "tracing",
            "span",
            "spans",
            "opentelemetry",
        ],
    },
    TaxonomyEntry {
        category: "git",
        keywords: &[
            "git",
            "github",
            "gitlab",
            "commit",
            "commits",
            "branch",
            "rebase",
            "pull request",
            "merge request",
        ],
    },
    TaxonomyEntry {
        category: "infrastructure",
        keywords: &[
            "terraform",
            "ansible",
            "docker",
            "server",
            "servers",
            "cpu",
            "memory",
            "disk",
            "network",
            "dns",
            "aws",
            "gcp",
            "azure",
            "vm",
        ],
    },
    TaxonomyEntry {
        category: "security",
        keywords: &[
            "rbac",
            "permission",
            "permissions",
            "forbidden",
            "unauthorized",
            "secret",
            "secrets",
            "certificate",
            "tls",
            "vault",
        ],
    },
];

/// Lowercase word tokens; anything not alphanumeric separates words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn entry_matches(entry: &TaxonomyEntry, tokens: &[String]) -> bool {
    entry.keywords.iter().any(|kw| keyword_matches(kw, tokens))
}

fn keyword_matches(keyword: &str, tokens: &[String]) -> bool {
    let parts: Vec<&str> = keyword.split_whitespace().collect();
    match parts.as_slice() {
        [] => false,
        [single] => tokens.iter().any(|t| t == single),
        _ => tokens
            .windows(parts.len())
            .any(|w| w.iter().zip(&parts).all(|(t, p)| t == p)),
    }
}

/// Primary category: the first taxonomy entry with a keyword hit.
pub fn resolve_category(text: &str) -> &'static str {
    let tokens = tokenize(text);
    TAXONOMY
        .iter()
        .find(|entry| entry_matches(entry, &tokens))
        .map_or(GENERAL, |entry| entry.category)
}

/// Every taxonomy entry with a keyword hit, in taxonomy order.
pub fn extract_topics(text: &str) -> Vec<&'static str> {
    let tokens = tokenize(text);
    TAXONOMY
        .iter()
        .filter(|entry| entry_matches(entry, &tokens))
        .map(|entry| entry.category)
        .collect()
}
