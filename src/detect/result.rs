/// Bounding box in normalized image coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl BBox {
    /// Clamp every coordinate into [0,1]. NaN collapses to 0.
    pub fn clamped(self) -> Self {
        fn unit(v: f32) -> f32 {
            v.max(0.0).min(1.0)
        }
        Self {
            xmin: unit(self.xmin),
            ymin: unit(self.ymin),
            xmax: unit(self.xmax),
            ymax: unit(self.ymax),
        }
    }
}

/// One detected object in a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: i32,
    pub score: f32,
    pub bbox: BBox,
}

/// Raw post-processed tensors of an SSD-style detection model.
///
/// `boxes` rows are `[ymin, xmin, ymax, xmax]`, matching the TFLite/ONNX
/// detection post-process layout. `count` is the number of valid rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelOutput {
    pub boxes: Vec<[f32; 4]>,
    pub class_ids: Vec<f32>,
    pub scores: Vec<f32>,
    pub count: usize,
}

impl ModelOutput {
    /// Number of rows that are present in every tensor and counted valid.
    pub fn valid_rows(&self) -> usize {
        self.count
            .min(self.boxes.len())
            .min(self.class_ids.len())
            .min(self.scores.len())
    }
}
