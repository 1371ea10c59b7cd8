use super::result::{BBox, Detection, ModelOutput};

/// Turn raw model tensors into detections.
///
/// Only the first `top_k` rows are considered, in the model's native order,
/// and each is kept when its score meets `score_threshold`. Scores that are
/// not finite never pass. The result is at most `top_k` long.
pub fn extract(output: &ModelOutput, score_threshold: f32, top_k: usize) -> Vec<Detection> {
    let rows = output.valid_rows().min(top_k);
    (0..rows)
        .filter(|&i| output.scores[i].is_finite() && output.scores[i] >= score_threshold)
        .map(|i| {
            let [ymin, xmin, ymax, xmax] = output.boxes[i];
            Detection {
                class_id: output.class_ids[i] as i32,
                score: output.scores[i].min(1.0),
                bbox: BBox {
                    xmin,
                    ymin,
                    xmax,
                    ymax,
                }
                .clamped(),
            }
        })
        .collect()
}
