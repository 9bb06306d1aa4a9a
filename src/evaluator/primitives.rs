//! Pure scoring functions shared by the analysis stages.

/// Clamps to [0, 1]. NaN maps to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Weighted mean of `(score, weight)` pairs, divided by the weights actually applied.
///
/// Returns 0 when no positive weight was applied.
pub fn weighted_mean(terms: &[(f64, f64)]) -> f64 {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;

    for &(score, weight) in terms {
        if weight <= 0.0 || !weight.is_finite() {
            continue;
        }
        weighted_sum += clamp_unit(score) * weight;
        total_weight += weight;
    }

    if total_weight > 0.0 {
        clamp_unit(weighted_sum / total_weight)
    } else {
        0.0
    }
}

/// Arithmetic mean, 0 for an empty slice
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// `min(count / scale, 1)`
pub fn saturating_ratio(count: f64, scale: f64) -> f64 {
    if scale <= 0.0 {
        return 0.0;
    }
    clamp_unit(count / scale)
}

/// Degree-based stand-in for betweenness centrality
pub fn centrality_proxy(from_degree: u64, to_degree: u64) -> f64 {
    saturating_ratio(from_degree.max(to_degree) as f64, 100.0)
}

/// Local clustering coefficient: edges among neighbors over the possible pairs.
pub fn clustering_coefficient(edges_among_neighbors: u64, neighbor_count: usize) -> f64 {
    if neighbor_count < 2 {
        return 0.0;
    }
    let possible = (neighbor_count * (neighbor_count - 1)) as f64 / 2.0;
    clamp_unit(edges_among_neighbors as f64 / possible)
}

/// Transfers in the last window, saturating at 50
pub fn velocity(recent_edges: u64) -> f64 {
    saturating_ratio(recent_edges as f64, 50.0)
}

/// Very short paths suggest a direct transfer, very long ones obfuscation.
pub fn path_length_risk(path_length: u32) -> f64 {
    if path_length <= 2 || path_length >= 8 {
        1.0
    } else {
        0.3
    }
}

pub fn component_size_risk(component_size: u64) -> f64 {
    saturating_ratio(component_size as f64, 1_000.0)
}

/// Monotonic in amount, capped at 0.8
pub fn amount_base_risk(amount: f64) -> f64 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0.0;
    }
    (amount / 100_000.0).min(0.8)
}
