use super::FeatureSeed;

/// Greedy radius suppression over seeds sorted by descending score.
pub fn radius_nms(seeds: Vec<FeatureSeed>, radius: f32, max_keep: usize) -> Vec<FeatureSeed> {
    let r2 = radius * radius;
    let mut kept: Vec<FeatureSeed> = Vec::with_capacity(seeds.len().min(max_keep));
    for s in seeds {
        if kept.len() == max_keep {
            break;
        }
        let crowded = kept.iter().any(|k| (s.px_uv - k.px_uv).norm_squared() <= r2);
        if !crowded {
            kept.push(s);
        }
    }
    kept
}
