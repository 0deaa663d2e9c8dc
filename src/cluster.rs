//! Deterministic k-means over small color vectors.
//!
//! Seeding is farthest-point: the first centroid is the sample farthest from
//! the global mean, each next one the sample farthest from all chosen
//! centroids. Ties resolve to the lowest index, so identical input always
//! yields identical clusters.

pub type Point = [f32; 3];

#[inline]
pub fn sq_dist(a: &Point, b: &Point) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone, PartialEq)]
pub struct KMeans {
    pub centroids: Vec<Point>,
    pub labels: Vec<usize>,
}

impl KMeans {
    /// Returns `None` when there are fewer samples than clusters.
    pub fn fit(samples: &[Point], k: usize, max_iterations: usize) -> Option<Self> {
        if k == 0 || samples.len() < k {
            return None;
        }

        let mut centroids = seed(samples, k);
        let mut labels = vec![usize::MAX; samples.len()];

        for _ in 0..max_iterations.max(1) {
            let mut changed = false;

            for (label, s) in labels.iter_mut().zip(samples) {
                let (nearest, _) = nearest(&centroids, s);
                if *label != nearest {
                    *label = nearest;
                    changed = true;
                }
            }

            let mut sums = vec![[0f32; 3]; k];
            let mut counts = vec![0usize; k];
            for (label, s) in labels.iter().zip(samples) {
                for c in 0..3 {
                    sums[*label][c] += s[c];
                }
                counts[*label] += 1;
            }

            for (i, centroid) in centroids.iter_mut().enumerate() {
                // an emptied cluster keeps its previous centroid
                if counts[i] > 0 {
                    let n = counts[i] as f32;
                    *centroid = [sums[i][0] / n, sums[i][1] / n, sums[i][2] / n];
                }
            }

            if !changed {
                break;
            }
        }

        Some(Self { centroids, labels })
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.centroids.len()];
        for l in &self.labels {
            sizes[*l] += 1;
        }
        sizes
    }
}

fn nearest(centroids: &[Point], s: &Point) -> (usize, f32) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, sq_dist(c, s)))
        .fold((0, f32::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

fn seed(samples: &[Point], k: usize) -> Vec<Point> {
    let n = samples.len() as f32;
    let mut mean = [0f32; 3];
    for s in samples {
        for c in 0..3 {
            mean[c] += s[c] / n;
        }
    }

    let farthest = |score: &dyn Fn(&Point) -> f32| {
        samples
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, s)| {
                let d = score(s);
                if d > best.1 {
                    (i, d)
                } else {
                    best
                }
            })
            .0
    };

    let mut centroids = vec![samples[farthest(&|s| sq_dist(s, &mean))]];
    while centroids.len() < k {
        let next = farthest(&|s| {
            centroids
                .iter()
                .map(|c| sq_dist(c, s))
                .fold(f32::INFINITY, f32::min)
        });
        centroids.push(samples[next]);
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_two_blobs() {
        let mut samples = Vec::new();
        for i in 0..10 {
            let j = i as f32;
            samples.push([200.0 + j, 20.0, 20.0]);
            samples.push([20.0, 20.0, 200.0 - j]);
        }

        let km = KMeans::fit(&samples, 2, 50).unwrap();
        assert_eq!(km.cluster_sizes(), vec![10, 10]);
        for pair in km.labels.chunks(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn too_few_samples() {
        assert!(KMeans::fit(&[[0.0, 0.0, 0.0]], 2, 10).is_none());
    }

    #[test]
    fn is_deterministic() {
        let samples: Vec<Point> = (0..30)
            .map(|i| [(i * 37 % 255) as f32, (i * 11 % 255) as f32, (i * 71 % 255) as f32])
            .collect();
        let a = KMeans::fit(&samples, 2, 50).unwrap();
        let b = KMeans::fit(&samples, 2, 50).unwrap();
        assert_eq!(a, b);
    }
}
