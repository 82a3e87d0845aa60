//! Classification of platform support images.
//!
//! Managed Kubernetes nodes run a fixed set of system containers next to
//! workloads. Flagging them lets triage focus on everything else.

/// Image bases shipped by GKE node pools.
pub const KNOWN_SUPPORT_IMAGES: &[&str] = &[
    "asia.gcr.io/gke-release-staging/cluster-proportional-autoscaler-amd64",
    "gcr.io/k8s-ingress-image-push/ingress-gce-404-server-with-metrics",
    "gke.gcr.io/cluster-proportional-autoscaler",
    "gke.gcr.io/csi-node-driver-registrar",
    "gke.gcr.io/event-exporter",
    "gke.gcr.io/fluent-bit",
    "gke.gcr.io/fluent-bit-gke-exporter",
    "gke.gcr.io/gcp-compute-persistent-disk-csi-driver",
    "gke.gcr.io/gke-metrics-agent",
    "gke.gcr.io/k8s-dns-dnsmasq-nanny",
    "gke.gcr.io/k8s-dns-kube-dns",
    "gke.gcr.io/k8s-dns-sidecar",
    "gke.gcr.io/kube-proxy-amd64",
    "gke.gcr.io/prometheus-to-sd",
    "gke.gcr.io/proxy-agent",
    "k8s.gcr.io/metrics-server/metrics-server",
    "k8s.gcr.io/pause",
];

/// Matches image references against a fixed table of bases.
#[derive(Debug, Clone, Copy)]
pub struct SupportClassifier {
    bases: &'static [&'static str],
}

impl Default for SupportClassifier {
    fn default() -> Self {
        Self::new(KNOWN_SUPPORT_IMAGES)
    }
}

impl SupportClassifier {
    pub fn new(bases: &'static [&'static str]) -> Self {
        Self { bases }
    }

    /// Whether `reference` names one of the known support images.
    pub fn is_support_image(&self, reference: &str) -> bool {
        let base = strip_reference_suffix(reference);
        !base.is_empty() && self.bases.contains(&base)
    }
}

/// Strip the `@digest` and `:tag` suffixes from an image reference.
///
/// A colon before the last `/` is a registry port, not a tag.
pub fn strip_reference_suffix(reference: &str) -> &str {
    let reference = reference
        .split_once('@')
        .map_or(reference, |(base, _)| base);
    let last_segment = reference.rfind('/').map_or(0, |i| i + 1);
    match reference[last_segment..].rfind(':') {
        Some(i) => &reference[..last_segment + i],
        None => reference,
    }
}
