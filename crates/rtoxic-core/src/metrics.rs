//! 評価指標

use crate::error::MetricError;

/// ROC AUC（同点は 0.5 として数える）
///
/// ラベルは 0.5 以上を正例とみなす。正例・負例のどちらかが無い場合は
/// `MetricError::Degenerate` を、NaN や無限大のスコアがあれば
/// `MetricError::NonFiniteScore` を返す。
pub fn roc_auc(scores: &[f32], labels: &[f32]) -> Result<f64, MetricError> {
    debug_assert_eq!(scores.len(), labels.len());
    let non_finite = scores.iter().filter(|s| !s.is_finite()).count();
    if non_finite > 0 {
        return Err(MetricError::NonFiniteScore { count: non_finite });
    }
    let mut items: Vec<(f32, bool)> =
        scores.iter().zip(labels).map(|(&s, &y)| (s, y >= 0.5)).collect();
    items.sort_by(|a, b| a.0.total_cmp(&b.0));

    let positives = items.iter().filter(|(_, y)| *y).count();
    let negatives = items.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(MetricError::Degenerate {
            positives,
            negatives,
        });
    }

    let mut auc_num = 0.0f64;
    let mut neg_cum = 0.0f64;
    let mut i = 0;
    while i < items.len() {
        let s = items[i].0;
        let mut j = i;
        let mut pos = 0.0f64;
        let mut neg = 0.0f64;
        while j < items.len() && items[j].0 == s {
            if items[j].1 {
                pos += 1.0;
            } else {
                neg += 1.0;
            }
            j += 1;
        }
        auc_num += pos * neg_cum + 0.5 * pos * neg;
        neg_cum += neg;
        i = j;
    }
    Ok(auc_num / (positives as f64 * negatives as f64))
}

/// すべて定義済みなら平均を返す（1つでも未定義なら `None`）
pub fn mean_defined<'a>(values: impl IntoIterator<Item = &'a Result<f64, MetricError>>) -> Option<f64> {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += *v.as_ref().ok()?;
        n += 1;
    }
    (n > 0).then(|| sum / n as f64)
}
