//! Built-in stage configuration tables.
//!
//! These mirror the configurations shipped with the hloc vision toolbox. The
//! `output` field names the artifact each configuration produces, which is
//! how downstream stages locate it.

use super::StageConf;
use serde_json::json;

/// Local feature and global (retrieval) descriptor extractors.
pub fn extractors() -> Vec<StageConf> {
    vec![
        StageConf::new(
            "superpoint_aachen",
            "feats-superpoint-n4096-r1024",
            json!({"name": "superpoint", "nms_radius": 3, "max_keypoints": 4096}),
        )
        .with_preprocessing(json!({"grayscale": true, "resize_max": 1024})),
        StageConf::new(
            "superpoint_max",
            "feats-superpoint-n4096-rmax1600",
            json!({"name": "superpoint", "nms_radius": 3, "max_keypoints": 4096}),
        )
        .with_preprocessing(json!({"grayscale": true, "resize_max": 1600, "resize_force": true})),
        StageConf::new(
            "superpoint_inloc",
            "feats-superpoint-n4096-r1600",
            json!({"name": "superpoint", "nms_radius": 4, "max_keypoints": 4096}),
        )
        .with_preprocessing(json!({"grayscale": true, "resize_max": 1600})),
        StageConf::new(
            "r2d2",
            "feats-r2d2-n5000-r1024",
            json!({"name": "r2d2", "max_keypoints": 5000}),
        )
        .with_preprocessing(json!({"grayscale": false, "resize_max": 1024})),
        StageConf::new(
            "d2net-ss",
            "feats-d2net-ss",
            json!({"name": "d2net", "multiscale": false}),
        )
        .with_preprocessing(json!({"grayscale": false, "resize_max": 1600})),
        StageConf::new("sift", "feats-sift", json!({"name": "dog"}))
            .with_preprocessing(json!({"grayscale": true, "resize_max": 1600})),
        StageConf::new(
            "sosnet",
            "feats-sosnet",
            json!({"name": "dog", "descriptor": "sosnet"}),
        )
        .with_preprocessing(json!({"grayscale": true, "resize_max": 1600})),
        StageConf::new(
            "disk",
            "feats-disk",
            json!({"name": "disk", "max_keypoints": 5000}),
        )
        .with_preprocessing(json!({"grayscale": false, "resize_max": 1600})),
        StageConf::new(
            "aliked-n16",
            "feats-aliked-n16",
            json!({"name": "aliked", "model_name": "aliked-n16"}),
        )
        .with_preprocessing(json!({"grayscale": false, "resize_max": 1024})),
        // Global descriptors used for image retrieval
        StageConf::new("dir", "global-feats-dir", json!({"name": "dir"}))
            .with_preprocessing(json!({"resize_max": 1024})),
        StageConf::new("netvlad", "global-feats-netvlad", json!({"name": "netvlad"}))
            .with_preprocessing(json!({"resize_max": 1024})),
        StageConf::new("openibl", "global-feats-openibl", json!({"name": "openibl"}))
            .with_preprocessing(json!({"resize_max": 1024})),
        StageConf::new(
            "eigenplaces",
            "global-feats-eigenplaces",
            json!({"name": "eigenplaces"}),
        )
        .with_preprocessing(json!({"resize_max": 1024})),
    ]
}

/// Descriptor matchers.
pub fn matchers() -> Vec<StageConf> {
    vec![
        StageConf::new(
            "superpoint+lightglue",
            "matches-superpoint-lightglue",
            json!({"name": "lightglue", "features": "superpoint"}),
        ),
        StageConf::new(
            "disk+lightglue",
            "matches-disk-lightglue",
            json!({"name": "lightglue", "features": "disk"}),
        ),
        StageConf::new(
            "aliked+lightglue",
            "matches-aliked-lightglue",
            json!({"name": "lightglue", "features": "aliked"}),
        ),
        StageConf::new(
            "superglue",
            "matches-superglue",
            json!({"name": "superglue", "weights": "outdoor", "sinkhorn_iterations": 50}),
        ),
        StageConf::new(
            "superglue-fast",
            "matches-superglue-it5",
            json!({"name": "superglue", "weights": "outdoor", "sinkhorn_iterations": 5}),
        ),
        StageConf::new(
            "NN-superpoint",
            "matches-NN-mutual-dist.7",
            json!({"name": "nearest_neighbor", "do_mutual_check": true, "distance_threshold": 0.7}),
        ),
        StageConf::new(
            "NN-ratio",
            "matches-NN-mutual-ratio.8",
            json!({"name": "nearest_neighbor", "do_mutual_check": true, "ratio_threshold": 0.8}),
        ),
        StageConf::new(
            "NN-mutual",
            "matches-NN-mutual",
            json!({"name": "nearest_neighbor", "do_mutual_check": true}),
        ),
        StageConf::new("adalam", "matches-adalam", json!({"name": "adalam"})),
    ]
}
