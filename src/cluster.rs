use geo::{Distance, Haversine, Point};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

pub const CLUSTER_COUNT: usize = 9;

const DEFAULT_SEED: u64 = 9;
const PASS_FACTOR: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterOutcome {
    Converged,
    MaxIterationsReached,
    Degenerate,
}

#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub id: usize,
    pub centroid: DataPoint,
    pub members: usize,
}

#[derive(Debug)]
pub struct ClusteringRun {
    pub outcome: ClusterOutcome,
    pub passes: usize,
    pub clusters: Vec<ClusterSummary>,
    pub assignments: Vec<usize>,
}

impl ClusteringRun {
    pub fn summary_lines(&self) -> Vec<String> {
        self.clusters
            .iter()
            .map(|cluster| format!("Cluster {} entries: {}", cluster.id, cluster.members))
            .collect()
    }
}

pub struct ClusterEngine {
    points: Vec<DataPoint>,
    assignments: Vec<usize>,
    centroids: Vec<DataPoint>,
    seed: u64,
    max_passes: usize,
}

impl ClusterEngine {
    pub fn new(points: Vec<DataPoint>) -> AppResult<Self> {
        if points.len() < CLUSTER_COUNT {
            return Err(AppError::Config(format!(
                "clustering needs at least {CLUSTER_COUNT} points, got {}",
                points.len()
            )));
        }
        let count = points.len();
        Ok(Self {
            assignments: vec![0; count],
            centroids: vec![
                DataPoint {
                    longitude: 0.0,
                    latitude: 0.0,
                };
                CLUSTER_COUNT
            ],
            seed: DEFAULT_SEED,
            max_passes: PASS_FACTOR * count,
            points,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[cfg(test)]
    fn with_pass_cap(mut self, cap: usize) -> Self {
        self.max_passes = cap.max(1);
        self
    }

    pub fn run(mut self) -> ClusteringRun {
        self.seed_assignments();
        let mut passes = 0;
        let outcome = loop {
            passes += 1;
            if !self.recompute_centroids() {
                break ClusterOutcome::Degenerate;
            }
            if !self.reassign_points() {
                break ClusterOutcome::Converged;
            }
            if passes >= self.max_passes {
                break ClusterOutcome::MaxIterationsReached;
            }
        };
        debug!(?outcome, passes, points = self.points.len(), "clustering finished");
        ClusteringRun {
            outcome,
            passes,
            clusters: self.snapshot_clusters(),
            assignments: self.assignments,
        }
    }

    fn seed_assignments(&mut self) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        for (index, slot) in self.assignments.iter_mut().enumerate() {
            *slot = if index < CLUSTER_COUNT {
                index
            } else {
                rng.gen_range(0..CLUSTER_COUNT)
            };
        }
    }

    fn recompute_centroids(&mut self) -> bool {
        let mut sums = vec![(0.0_f64, 0.0_f64, 0_usize); CLUSTER_COUNT];
        for (point, cluster) in self.points.iter().zip(&self.assignments) {
            let entry = &mut sums[*cluster];
            entry.0 += point.longitude;
            entry.1 += point.latitude;
            entry.2 += 1;
        }
        for (id, (longitude_sum, latitude_sum, members)) in sums.into_iter().enumerate() {
            if members == 0 {
                warn!(cluster = id, "cluster emptied during reassignment");
                return false;
            }
            self.centroids[id] = DataPoint {
                longitude: longitude_sum / members as f64,
                latitude: latitude_sum / members as f64,
            };
        }
        true
    }

    fn reassign_points(&mut self) -> bool {
        let mut moved = false;
        for (point, assignment) in self.points.iter().zip(self.assignments.iter_mut()) {
            let nearest = nearest_centroid(point, &self.centroids);
            if nearest != *assignment {
                *assignment = nearest;
                moved = true;
            }
        }
        moved
    }

    fn snapshot_clusters(&self) -> Vec<ClusterSummary> {
        let mut members = vec![0_usize; CLUSTER_COUNT];
        for cluster in &self.assignments {
            members[*cluster] += 1;
        }
        self.centroids
            .iter()
            .enumerate()
            .map(|(id, centroid)| ClusterSummary {
                id,
                centroid: *centroid,
                members: members[id],
            })
            .collect()
    }
}

fn nearest_centroid(point: &DataPoint, centroids: &[DataPoint]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::MAX;
    for (id, centroid) in centroids.iter().enumerate() {
        let distance = haversine_between(point, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = id;
        }
    }
    best
}

fn haversine_between(a: &DataPoint, b: &DataPoint) -> f64 {
    Haversine::distance(
        Point::new(a.longitude, a.latitude),
        Point::new(b.longitude, b.latitude),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distinct_points(n: usize) -> Vec<DataPoint> {
        (0..n)
            .map(|i| {
                let angle = i as f64 * 0.7;
                DataPoint {
                    longitude: -3.0 + angle.sin() * 2.0,
                    latitude: 52.0 + angle.cos() * 2.0,
                }
            })
            .collect()
    }

    fn identical_points(n: usize) -> Vec<DataPoint> {
        vec![
            DataPoint {
                longitude: -0.1276,
                latitude: 51.5072,
            };
            n
        ]
    }

    #[test]
    fn rejects_fewer_points_than_clusters() {
        let result = ClusterEngine::new(distinct_points(8));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn nine_distinct_points_converge_in_one_pass() {
        let run = ClusterEngine::new(distinct_points(9)).unwrap().run();

        assert_eq!(run.outcome, ClusterOutcome::Converged);
        assert_eq!(run.passes, 1);
        assert_eq!(run.clusters.len(), CLUSTER_COUNT);
        for cluster in &run.clusters {
            assert_eq!(cluster.members, 1);
        }
        assert_eq!(run.assignments, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn identical_points_collapse_to_lowest_id_and_go_degenerate() {
        let run = ClusterEngine::new(identical_points(9)).unwrap().run();

        assert_eq!(run.outcome, ClusterOutcome::Degenerate);
        assert_eq!(run.passes, 2);
        assert!(run.assignments.iter().all(|cluster| *cluster == 0));
        assert_eq!(run.clusters[0].members, 9);
        for cluster in &run.clusters[1..] {
            assert_eq!(cluster.members, 0);
        }
    }

    #[test]
    fn degenerate_run_still_reports_every_cluster() {
        let run = ClusterEngine::new(identical_points(12)).unwrap().run();

        assert_eq!(run.outcome, ClusterOutcome::Degenerate);
        assert_eq!(run.clusters.len(), CLUSTER_COUNT);
        let lines = run.summary_lines();
        assert_eq!(lines.len(), CLUSTER_COUNT);
        assert_eq!(lines[0], "Cluster 0 entries: 12");
        assert_eq!(lines[8], "Cluster 8 entries: 0");
    }

    #[test]
    fn pass_cap_reports_soft_success() {
        let run = ClusterEngine::new(identical_points(9))
            .unwrap()
            .with_pass_cap(1)
            .run();

        assert_eq!(run.outcome, ClusterOutcome::MaxIterationsReached);
        assert_eq!(run.passes, 1);
    }

    #[test]
    fn same_seed_runs_are_identical() {
        let first = ClusterEngine::new(distinct_points(40))
            .unwrap()
            .with_seed(7)
            .run();
        let second = ClusterEngine::new(distinct_points(40))
            .unwrap()
            .with_seed(7)
            .run();

        assert_eq!(first.outcome, second.outcome);
        assert_eq!(first.passes, second.passes);
        assert_eq!(first.assignments, second.assignments);
        let first_counts: Vec<_> = first.clusters.iter().map(|c| c.members).collect();
        let second_counts: Vec<_> = second.clusters.iter().map(|c| c.members).collect();
        assert_eq!(first_counts, second_counts);
    }

    #[test]
    fn every_point_is_accounted_for() {
        let run = ClusterEngine::new(distinct_points(40)).unwrap().run();

        assert_eq!(run.clusters.len(), CLUSTER_COUNT);
        let total: usize = run.clusters.iter().map(|c| c.members).sum();
        assert_eq!(total, 40);
        if run.outcome == ClusterOutcome::Converged {
            assert!(run.clusters.iter().all(|c| c.members >= 1));
        }
    }

    #[test]
    fn summary_lines_render_ascending_cluster_ids() {
        let run = ClusterEngine::new(distinct_points(9)).unwrap().run();
        let lines = run.summary_lines();
        for (id, line) in lines.iter().enumerate() {
            assert_eq!(line, &format!("Cluster {id} entries: 1"));
        }
    }

    #[test]
    fn haversine_orders_uk_distances_sanely() {
        let london = DataPoint {
            longitude: -0.1276,
            latitude: 51.5072,
        };
        let birmingham = DataPoint {
            longitude: -1.8904,
            latitude: 52.4862,
        };
        let edinburgh = DataPoint {
            longitude: -3.1883,
            latitude: 55.9533,
        };

        assert!(haversine_between(&london, &london) < 1e-9);
        let to_birmingham = haversine_between(&london, &birmingham);
        let to_edinburgh = haversine_between(&london, &edinburgh);
        assert!(to_birmingham > 0.0);
        assert!(to_birmingham < to_edinburgh);
        assert!((haversine_between(&birmingham, &london) - to_birmingham).abs() < 1e-9);
    }
}
