use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use crate::types::{ClassifiedRecord, Direction};

pub const FEATURE_COUNT: usize = 27;

// Absent TCP fields take part in the statistics as -1, which is how
// the streaming model saw them during training.
const ABSENT: i64 = -1;

/// Every statistic the aggregator produces for one (client, window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureName {
    PktEntropy,
    UpPktEntropy,
    DwPktEntropy,
    UpSpeed,
    DwSpeed,
    NetUpdown,
    DivUpdown,
    DivUpdownVar,
    UpPktVar,
    DwPktVar,
    UpPktAvg,
    DwPktAvg,
    DwTtlUnique,
    DwTtlAvg,
    TcpAckVar,
    UpdwPkt,
    DlPktAvg,
    DlPktEntropy,
    Jitter,
    NumUniqueIps,
    TcpNports,
    UdpNports,
    TcpSeq,
    TcpAck,
    TcpFlags,
    TtlEntropy,
    AckEntropy,
}

impl FeatureName {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureName::PktEntropy => "pkt_entropy",
            FeatureName::UpPktEntropy => "up_pkt_entropy",
            FeatureName::DwPktEntropy => "dw_pkt_entropy",
            FeatureName::UpSpeed => "up_speed",
            FeatureName::DwSpeed => "dw_speed",
            FeatureName::NetUpdown => "net_updown",
            FeatureName::DivUpdown => "div_updown",
            FeatureName::DivUpdownVar => "div_updown_var",
            FeatureName::UpPktVar => "up_pkt_var",
            FeatureName::DwPktVar => "dw_pkt_var",
            FeatureName::UpPktAvg => "up_pkt_avg",
            FeatureName::DwPktAvg => "dw_pkt_avg",
            FeatureName::DwTtlUnique => "dw_ttl_unique",
            FeatureName::DwTtlAvg => "dw_ttl_avg",
            FeatureName::TcpAckVar => "tcp_ack_var",
            FeatureName::UpdwPkt => "updw_pkt",
            FeatureName::DlPktAvg => "dl_pkt_avg",
            FeatureName::DlPktEntropy => "dl_pkt_entropy",
            FeatureName::Jitter => "jitter",
            FeatureName::NumUniqueIps => "num_unique_ips",
            FeatureName::TcpNports => "tcp_nports",
            FeatureName::UdpNports => "udp_nports",
            FeatureName::TcpSeq => "tcp_seq",
            FeatureName::TcpAck => "tcp_ack",
            FeatureName::TcpFlags => "tcp_flags",
            FeatureName::TtlEntropy => "ttl_entropy",
            FeatureName::AckEntropy => "ack_entropy",
        }
    }
}

/// Statistics of one client's traffic in one window. Only complete rows are ever built.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub client: Ipv4Addr,
    /// floor(timestamp / window width)
    pub bucket: i64,
    values: [f64; FEATURE_COUNT],
}

impl FeatureVector {
    #[inline]
    pub fn get(&self, name: FeatureName) -> f64 {
        self.values[name.index()]
    }

    /// Model input row, in the order of `names`.
    pub fn select(&self, names: &[FeatureName]) -> Vec<f32> {
        names.iter().map(|n| self.get(*n) as f32).collect()
    }
}

#[derive(Debug, Default)]
pub struct WindowOutput {
    pub vectors: Vec<FeatureVector>,
    /// Non-empty windows discarded because a statistic was undefined
    pub dropped: usize,
}

/// Bucket records by (client, window) and compute one feature vector per bucket.
///
/// Output is ordered by client then bucket. Rows with an undefined
/// statistic (a mean or variance over too few packets, an entropy over
/// an empty direction) are discarded rather than patched with defaults.
pub fn aggregate_windows(records: &[ClassifiedRecord], window_secs: f64) -> WindowOutput {
    let mut buckets: BTreeMap<(Ipv4Addr, i64), Vec<&ClassifiedRecord>> = BTreeMap::new();
    for r in records {
        let bucket = (r.packet.timestamp / window_secs).floor() as i64;
        buckets.entry((r.client, bucket)).or_default().push(r);
    }

    let mut out = WindowOutput::default();
    for ((client, bucket), mut group) in buckets {
        // stable, so equal timestamps keep capture order
        group.sort_by(|a, b| a.packet.timestamp.total_cmp(&b.packet.timestamp));
        let values = window_features(&group, window_secs);
        if values.iter().any(|v| v.is_nan()) {
            out.dropped += 1;
            continue;
        }
        out.vectors.push(FeatureVector { client, bucket, values });
    }
    out
}

fn window_features(group: &[&ClassifiedRecord], window_secs: f64) -> [f64; FEATURE_COUNT] {
    let (up, dw): (Vec<&ClassifiedRecord>, Vec<&ClassifiedRecord>) =
        group.iter().copied().partition(|r| r.direction == Direction::Upload);

    let up_sizes: Vec<f64> = up.iter().map(|r| r.packet.size as f64).collect();
    let dw_sizes: Vec<f64> = dw.iter().map(|r| r.packet.size as f64).collect();
    let up_sum: f64 = up_sizes.iter().sum();
    let dw_sum: f64 = dw_sizes.iter().sum();
    let up_avg = mean(&up_sizes);
    let dw_avg = mean(&dw_sizes);
    let up_var = variance(&up_sizes);
    let dw_var = variance(&dw_sizes);

    let dw_ttls: Vec<f64> = dw.iter().map(|r| r.packet.ttl as f64).collect();
    let acks: Vec<i64> = group.iter().map(|r| r.packet.tcp.map_or(ABSENT, |t| t.ack as i64)).collect();
    let ack_values: Vec<f64> = acks.iter().map(|a| *a as f64).collect();

    let gaps: Vec<f64> = group
        .windows(2)
        .map(|w| w[1].packet.timestamp - w[0].packet.timestamp)
        .collect();

    let mut v = [f64::NAN; FEATURE_COUNT];
    let mut set = |name: FeatureName, value: f64| v[name.index()] = value;

    set(FeatureName::PktEntropy, entropy(group.iter().map(|r| r.packet.size)));
    set(FeatureName::UpPktEntropy, entropy(up.iter().map(|r| r.packet.size)));
    set(FeatureName::DwPktEntropy, entropy(dw.iter().map(|r| r.packet.size)));
    set(FeatureName::UpSpeed, up_sum / window_secs);
    set(FeatureName::DwSpeed, dw_sum / window_secs);
    set(
        FeatureName::NetUpdown,
        group.iter().map(|r| f64::from(r.direction.sign()) * r.packet.size as f64).sum(),
    );
    set(FeatureName::DivUpdown, up_sum / floor_one(dw_sum));
    set(FeatureName::DivUpdownVar, up_var / floor_one(dw_var));
    set(FeatureName::UpPktVar, up_var);
    set(FeatureName::DwPktVar, dw_var);
    set(FeatureName::UpPktAvg, up_avg);
    set(FeatureName::DwPktAvg, dw_avg);
    set(FeatureName::DwTtlUnique, distinct(dw.iter().map(|r| r.packet.ttl)));
    set(FeatureName::DwTtlAvg, mean(&dw_ttls));
    set(FeatureName::TcpAckVar, variance(&ack_values));
    set(FeatureName::UpdwPkt, dw_avg - up_avg);
    set(FeatureName::DlPktAvg, mean(&gaps));
    set(FeatureName::DlPktEntropy, entropy(gaps.iter().map(|g| g.to_bits())));
    set(FeatureName::Jitter, variance(&gaps));
    set(FeatureName::NumUniqueIps, distinct(group.iter().map(|r| r.server)));
    set(
        FeatureName::TcpNports,
        distinct(group.iter().map(|r| r.packet.tcp.map(|t| t.src_port)))
            + distinct(group.iter().map(|r| r.packet.tcp.map(|t| t.dst_port))),
    );
    set(
        FeatureName::UdpNports,
        distinct(group.iter().map(|r| r.packet.udp.map(|u| u.src_port)))
            + distinct(group.iter().map(|r| r.packet.udp.map(|u| u.dst_port))),
    );
    set(FeatureName::TcpSeq, distinct(group.iter().map(|r| r.packet.tcp.map(|t| t.seq))));
    set(FeatureName::TcpAck, distinct(acks.iter().copied()));
    set(
        FeatureName::TcpFlags,
        distinct(group.iter().map(|r| r.packet.tcp.map(|t| t.flags).filter(|f| *f != 0))),
    );
    set(FeatureName::TtlEntropy, entropy(group.iter().map(|r| r.packet.ttl)));
    set(FeatureName::AckEntropy, entropy(acks.iter().copied()));
    v
}

/// Ratio denominator floor. NaN stays NaN so an empty direction still voids the row.
#[inline]
fn floor_one(x: f64) -> f64 {
    if x.is_nan() { x } else { x.max(1.0) }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NAN;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample variance (n - 1 denominator); undefined below two values.
fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return f64::NAN;
    }
    let m = mean(xs);
    let m2: f64 = xs.iter().map(|x| (x - m) * (x - m)).sum();
    m2 / (xs.len() - 1) as f64
}

/// Shannon entropy in bits of the empirical distribution of `values`.
pub fn entropy<K: Ord, I: IntoIterator<Item = K>>(values: I) -> f64 {
    let mut counts: BTreeMap<K, u64> = BTreeMap::new();
    let mut n = 0u64;
    for v in values {
        *counts.entry(v).or_insert(0) += 1;
        n += 1;
    }
    if n == 0 {
        return f64::NAN;
    }
    let n = n as f64;
    -counts
        .values()
        .map(|c| {
            let p = *c as f64 / n;
            p * p.log2()
        })
        .sum::<f64>()
}

fn distinct<K: Ord, I: IntoIterator<Item = K>>(values: I) -> f64 {
    values.into_iter().collect::<BTreeSet<K>>().len() as f64
}
