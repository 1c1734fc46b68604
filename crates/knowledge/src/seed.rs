//! Starter knowledge written into an empty knowledge base.

use crate::document::{DocType, Document};

struct SeedEntry {
    id: &'static str,
    doc_type: DocType,
    category: &'static str,
    title: &'static str,
    content: &'static str,
    tags: &'static [&'static str],
    source_url: Option<&'static str>,
}

const CATALOG: &[SeedEntry] = &[
    SeedEntry {
        id: "seed-k8s-crashloop",
        doc_type: DocType::Troubleshoot,
        category: "kubernetes",
        title: "Pod stuck in CrashLoopBackOff",
        content: "A pod in CrashLoopBackOff starts, exits and is restarted with growing back-off. \
                  Read the previous container logs with `kubectl logs <pod> --previous`, then \
                  `kubectl describe pod <pod>` for exit codes and events. Exit code 137 means the \
                  container was OOM killed: raise the memory limit or fix the leak. Exit code 1 \
                  usually points at bad configuration or a missing secret.",
        tags: &["kubernetes", "pods", "crashloopbackoff"],
        source_url: Some(
            "https://kubernetes.io/docs/tasks/debug/debug-application/debug-pods/",
        ),
    },
    SeedEntry {
        id: "seed-k8s-rollout",
        doc_type: DocType::Runbook,
        category: "kubernetes",
        title: "Roll back a Kubernetes deployment",
        content: "Check history with `kubectl rollout history deployment/<name>`. Roll back with \
                  `kubectl rollout undo deployment/<name>` or pin a revision with \
                  `--to-revision=<n>`. Watch progress using `kubectl rollout status`.",
        tags: &["kubernetes", "deployment", "rollback"],
        source_url: None,
    },
    SeedEntry {
        id: "seed-prometheus-cpu-alert",
        doc_type: DocType::Runbook,
        category: "monitoring",
        title: "High CPU alert from Prometheus",
        content: "Confirm the alert in Alertmanager, then find the top consumers with \
                  `topk(5, rate(container_cpu_usage_seconds_total[5m]))`. Compare against \
                  requests and limits. If the load is legitimate, scale out; if not, look for a \
                  hot loop in a recent deploy.",
        tags: &["prometheus", "alert", "cpu", "promql"],
        source_url: None,
    },
    SeedEntry {
        id: "seed-loki-queries",
        doc_type: DocType::Knowledge,
        category: "logging",
        title: "Querying logs with Loki",
        content: "LogQL selects streams by label then filters lines: \
                  `{app=\"api\"} |= \"error\"`. Use `| json` to parse structured logs and \
                  `rate({app=\"api\"} |= \"error\" [5m])` to turn log lines into a metric. Narrow \
                  the time range first; wide queries over many streams are slow.",
        tags: &["loki", "logql", "logs"],
        source_url: Some("https://grafana.com/docs/loki/latest/query/"),
    },
    SeedEntry {
        id: "seed-tracing-latency",
        doc_type: DocType::Troubleshoot,
        category: "tracing",
        title: "Finding latency with distributed traces",
        content: "Search traces for the slow endpoint and sort by duration. The widest span on \
                  the critical path is the bottleneck. Gaps between spans usually mean queueing \
                  or an uninstrumented call. Check that trace context propagates across every \
                  service boundary.",
        tags: &["tracing", "latency", "spans"],
        source_url: None,
    },
    SeedEntry {
        id: "seed-git-revert",
        doc_type: DocType::Runbook,
        category: "git",
        title: "Undo a bad commit on a shared branch",
        content: "On a shared branch never rewrite history. Create an inverse commit with \
                  `git revert <sha>`; for a merge commit add `-m 1`. Locally, before pushing, \
                  `git reset --soft HEAD~1` keeps the changes staged.",
        tags: &["git", "revert", "commit"],
        source_url: None,
    },
    SeedEntry {
        id: "seed-disk-full",
        doc_type: DocType::Troubleshoot,
        category: "infrastructure",
        title: "Server disk is full",
        content: "Find the largest directories with `du -xh / | sort -h | tail`. Common culprits \
                  are rotated logs, container images and deleted files still held open \
                  (`lsof +L1`). Prune unused images with `docker system prune` and fix log \
                  rotation before the disk fills again.",
        tags: &["disk", "server", "docker"],
        source_url: None,
    },
    SeedEntry {
        id: "seed-rbac-forbidden",
        doc_type: DocType::Troubleshoot,
        category: "security",
        title: "RBAC forbidden errors",
        content: "A `forbidden` response names the user, verb and resource that were denied. \
                  Check with `kubectl auth can-i <verb> <resource> --as <user>`, then inspect \
                  the Role or ClusterRole bound to that subject. Grant the narrowest permission \
                  that works.",
        tags: &["rbac", "permissions", "forbidden"],
        source_url: None,
    },
    SeedEntry {
        id: "seed-incident-process",
        doc_type: DocType::Knowledge,
        category: "general",
        title: "Incident response basics",
        content: "Declare the incident early and name one incident lead. Mitigate first, \
                  investigate second. Keep a timeline of actions as they happen and write the \
                  postmortem within a week, focused on contributing factors rather than blame.",
        tags: &["incident", "process"],
        source_url: None,
    },
];

/// The starter documents. Ids are fixed so reseeding upserts in place.
pub fn catalog() -> Vec<Document> {
    CATALOG
        .iter()
        .map(|entry| {
            Document::with_id(
                entry.id,
                entry.doc_type,
                entry.title,
                entry.content,
                entry.category,
            )
            .with_tags(entry.tags.iter().map(|t| t.to_string()))
            .with_confidence(0.9)
            .with_source_url(entry.source_url.map(str::to_string))
        })
        .collect()
}
