//! Offline clustering of scene and face vectors.
//!
//! Density-based grouping (DBSCAN over cosine distance): clusters need
//! not be balanced, noise and singletons go to the dedicated
//! unclustered id. Each row also gets a within-cluster order key, its
//! cosine distance to the cluster centroid, so consumers can show the
//! most representative members first. Re-running overwrites prior
//! assignments.

use anyhow::Result;

use crate::pipeline::MODEL_CLIP;
use crate::store::{cosine_similarity, Store};

/// Cluster id assigned to noise points.
pub const UNCLUSTERED_ID: i64 = -1;

/// Order key for unclustered rows, sorting them after any real member.
const UNCLUSTERED_ORDER: f64 = 999.0;

/// Minimum members for a cluster (a pair of alike vectors suffices).
const MIN_CLUSTER_SIZE: usize = 2;

/// Neighborhood radii in cosine distance. Face embeddings separate
/// cleanly; scene embeddings of distinct shots sit closer together.
const FACE_EPS: f32 = 0.35;
const SCENE_EPS: f32 = 0.25;

/// One row's final assignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub id: i64,
    pub cluster_id: i64,
    pub cluster_order: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterOutcome {
    pub clusters: usize,
    pub clustered: usize,
    pub unclustered: usize,
}

/// Cluster all face vectors and persist the assignments.
pub fn cluster_faces(store: &Store) -> Result<ClusterOutcome> {
    let rows = store.all_face_embeddings()?;
    let assignments = assign_clusters(&rows, FACE_EPS);
    for a in &assignments {
        store.set_face_cluster(a.id, a.cluster_id, a.cluster_order)?;
    }
    let outcome = summarize(&assignments);
    tracing::info!(
        faces = rows.len(),
        clusters = outcome.clusters,
        unclustered = outcome.unclustered,
        "Face clustering complete"
    );
    Ok(outcome)
}

/// Cluster all scene visual vectors and persist the assignments.
pub fn cluster_scenes(store: &Store) -> Result<ClusterOutcome> {
    let rows = store.embeddings_for_model(MODEL_CLIP)?;
    let assignments = assign_clusters(&rows, SCENE_EPS);
    for a in &assignments {
        store.set_scene_cluster(a.id, a.cluster_id, a.cluster_order)?;
    }
    let outcome = summarize(&assignments);
    tracing::info!(
        scenes = rows.len(),
        clusters = outcome.clusters,
        unclustered = outcome.unclustered,
        "Scene clustering complete"
    );
    Ok(outcome)
}

fn summarize(assignments: &[Assignment]) -> ClusterOutcome {
    let mut outcome = ClusterOutcome::default();
    let mut seen = std::collections::HashSet::new();
    for a in assignments {
        if a.cluster_id == UNCLUSTERED_ID {
            outcome.unclustered += 1;
        } else {
            outcome.clustered += 1;
            seen.insert(a.cluster_id);
        }
    }
    outcome.clusters = seen.len();
    outcome
}

/// DBSCAN over cosine distance, then centroid ordering and a dense
/// remap of cluster ids by descending cluster size.
pub fn assign_clusters(rows: &[(i64, Vec<f32>)], eps: f32) -> Vec<Assignment> {
    let n = rows.len();
    if n == 0 {
        return Vec::new();
    }

    let labels = dbscan(rows, eps);

    // Centroids per raw label.
    let mut sums: std::collections::HashMap<i64, Vec<f32>> = std::collections::HashMap::new();
    let mut sizes: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
    for (i, &label) in labels.iter().enumerate() {
        if label == UNCLUSTERED_ID {
            continue;
        }
        let dim = rows[i].1.len();
        let sum = sums.entry(label).or_insert_with(|| vec![0.0; dim]);
        for (s, v) in sum.iter_mut().zip(rows[i].1.iter()) {
            *s += v;
        }
        *sizes.entry(label).or_insert(0) += 1;
    }

    let mut centroids: std::collections::HashMap<i64, Vec<f32>> = std::collections::HashMap::new();
    for (label, sum) in &sums {
        let count = sizes[label] as f32;
        let mean: Vec<f32> = sum.iter().map(|s| s / count).collect();
        let norm: f32 = mean.iter().map(|x| x * x).sum::<f32>().sqrt();
        let centroid = if norm > 0.0 {
            mean.iter().map(|x| x / norm).collect()
        } else {
            mean
        };
        centroids.insert(*label, centroid);
    }

    // Largest clusters take the smallest ids; ties broken by raw label
    // so reruns stay deterministic.
    let mut by_size: Vec<(i64, usize)> = sizes.into_iter().collect();
    by_size.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let remap: std::collections::HashMap<i64, i64> = by_size
        .iter()
        .enumerate()
        .map(|(new, (old, _))| (*old, new as i64))
        .collect();

    rows.iter()
        .zip(labels.iter())
        .map(|((id, embedding), &label)| {
            if label == UNCLUSTERED_ID {
                Assignment {
                    id: *id,
                    cluster_id: UNCLUSTERED_ID,
                    cluster_order: UNCLUSTERED_ORDER,
                }
            } else {
                let centroid = &centroids[&label];
                let distance = 1.0 - cosine_similarity(embedding, centroid);
                Assignment {
                    id: *id,
                    cluster_id: remap[&label],
                    cluster_order: distance as f64,
                }
            }
        })
        .collect()
}

/// Plain DBSCAN. Pairwise distances are fine at this population size;
/// the whole pass runs offline between ingest cycles.
fn dbscan(rows: &[(i64, Vec<f32>)], eps: f32) -> Vec<i64> {
    const UNVISITED: i64 = -2;
    let n = rows.len();
    let mut labels = vec![UNVISITED; n];
    let mut next_cluster = 0i64;

    let neighbors = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| {
                j != i && 1.0 - cosine_similarity(&rows[i].1, &rows[j].1) <= eps
            })
            .collect()
    };

    for i in 0..n {
        if labels[i] != UNVISITED {
            continue;
        }

        let seed_neighbors = neighbors(i);
        // Core point check counts the point itself.
        if seed_neighbors.len() + 1 < MIN_CLUSTER_SIZE {
            labels[i] = UNCLUSTERED_ID;
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[i] = cluster;

        let mut queue: std::collections::VecDeque<usize> = seed_neighbors.into();
        while let Some(j) = queue.pop_front() {
            if labels[j] == UNCLUSTERED_ID {
                // Border point: claimed by the cluster, not expanded.
                labels[j] = cluster;
                continue;
            }
            if labels[j] != UNVISITED {
                continue;
            }
            labels[j] = cluster;

            let j_neighbors = neighbors(j);
            if j_neighbors.len() + 1 >= MIN_CLUSTER_SIZE {
                queue.extend(j_neighbors);
            }
        }
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(vectors: &[&[f32]]) -> Vec<(i64, Vec<f32>)> {
        vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i as i64 + 1, v.to_vec()))
            .collect()
    }

    #[test]
    fn test_empty_population() {
        assert!(assign_clusters(&[], 0.3).is_empty());
    }

    #[test]
    fn test_two_groups_and_noise() {
        // Two tight pairs on different axes plus one lone outlier.
        let data = rows(&[
            &[1.0, 0.0, 0.0],
            &[0.999, 0.04, 0.0],
            &[0.0, 1.0, 0.0],
            &[0.04, 0.999, 0.0],
            &[0.577, 0.577, 0.577],
        ]);

        let assignments = assign_clusters(&data, 0.1);
        let outcome = summarize(&assignments);
        assert_eq!(outcome.clusters, 2);
        assert_eq!(outcome.clustered, 4);
        assert_eq!(outcome.unclustered, 1);

        // The pairs land in the same cluster as each other.
        assert_eq!(assignments[0].cluster_id, assignments[1].cluster_id);
        assert_eq!(assignments[2].cluster_id, assignments[3].cluster_id);
        assert_ne!(assignments[0].cluster_id, assignments[2].cluster_id);
        assert_eq!(assignments[4].cluster_id, UNCLUSTERED_ID);
        assert_eq!(assignments[4].cluster_order, 999.0);
    }

    #[test]
    fn test_singleton_is_noise() {
        let data = rows(&[&[1.0, 0.0]]);
        let assignments = assign_clusters(&data, 0.3);
        assert_eq!(assignments[0].cluster_id, UNCLUSTERED_ID);
    }

    #[test]
    fn test_order_key_ranks_representative_first() {
        // Three members; the middle one sits nearest the centroid.
        let data = rows(&[
            &[1.0, 0.0],
            &[0.962, 0.275],
            &[0.85, 0.527],
        ]);
        let assignments = assign_clusters(&data, 0.2);
        assert!(assignments.iter().all(|a| a.cluster_id == 0));
        assert!(assignments[1].cluster_order < assignments[0].cluster_order);
        assert!(assignments[1].cluster_order < assignments[2].cluster_order);
    }

    #[test]
    fn test_cluster_ids_remapped_by_size() {
        // A triple and a pair; the triple should get id 0.
        let data = rows(&[
            &[0.0, 1.0, 0.0],
            &[0.03, 0.999, 0.0],
            &[1.0, 0.0, 0.0],
            &[0.999, 0.04, 0.0],
            &[0.02, 0.998, 0.05],
        ]);
        let assignments = assign_clusters(&data, 0.1);
        // Triple: rows 1, 2, 5 (y-axis). Pair: rows 3, 4 (x-axis).
        assert_eq!(assignments[0].cluster_id, 0);
        assert_eq!(assignments[1].cluster_id, 0);
        assert_eq!(assignments[4].cluster_id, 0);
        assert_eq!(assignments[2].cluster_id, 1);
        assert_eq!(assignments[3].cluster_id, 1);
    }

    #[test]
    fn test_persisted_assignments() {
        use crate::store::{FsMeta, NewScene, Store};

        let mut store = Store::open_in_memory().unwrap();
        let file_id = store
            .insert_file("/media/a.mp4", "a.mp4", &FsMeta::default())
            .unwrap();
        let scene_ids = store
            .replace_scenes(
                file_id,
                &[
                    NewScene { start_tc: 0.0, end_tc: 5.0 },
                    NewScene { start_tc: 5.0, end_tc: 9.0 },
                ],
            )
            .unwrap();
        store
            .upsert_embedding(scene_ids[0], "clip", "v1", &[1.0, 0.0])
            .unwrap();
        store
            .upsert_embedding(scene_ids[1], "clip", "v1", &[0.999, 0.045])
            .unwrap();

        let outcome = cluster_scenes(&store).unwrap();
        assert_eq!(outcome.clusters, 1);
        assert_eq!(outcome.clustered, 2);

        let scene = store.get_scene(scene_ids[0]).unwrap().unwrap();
        assert_eq!(scene.clip_cluster_id, Some(0));
        assert!(scene.clip_cluster_order.is_some());
    }
}
