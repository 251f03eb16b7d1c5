use crate::core::appx::identity::PackageTarget;
use crate::core::cancel::CancelFlag;
use crate::core::removal::orchestrator::{RemovalOrchestrator, RemovalReport};
use crate::progress::removal_progress::ProgressCb;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// 同一个包（不区分大小写）的请求放在同一组里顺序执行，不同的包并发执行
fn group_by_package(targets: Vec<PackageTarget>) -> Vec<Vec<(usize, PackageTarget)>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<(usize, PackageTarget)>> = Vec::new();
    for (i, target) in targets.into_iter().enumerate() {
        let key = target.canonical_id.to_lowercase();
        match index.get(&key) {
            Some(&g) => groups[g].push((i, target)),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![(i, target)]);
            }
        }
    }
    groups
}

fn prefixed(sink: &Option<ProgressCb>, label: &str) -> Option<ProgressCb> {
    sink.as_ref().map(|cb| {
        let cb = cb.clone();
        let label = label.to_string();
        Arc::new(move |line: String| cb(format!("[{}] {}", label, line))) as ProgressCb
    })
}

/// 批量卸载，返回的报告与输入顺序一致
pub async fn remove_many(
    orchestrator: Arc<RemovalOrchestrator>,
    targets: Vec<PackageTarget>,
    sink: Option<ProgressCb>,
    cancel: CancelFlag,
    concurrency: usize,
) -> Vec<RemovalReport> {
    let start = Instant::now();
    let total = targets.len();
    let concurrency = concurrency.max(1);
    let groups = group_by_package(targets);
    info!("批量卸载 {} 个包，{} 组，并发度 {}", total, groups.len(), concurrency);

    let mut reports: Vec<(usize, RemovalReport)> = stream::iter(groups)
        .map(|group| {
            let orchestrator = orchestrator.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            async move {
                let mut done = Vec::with_capacity(group.len());
                for (i, target) in group {
                    let cb = prefixed(&sink, target.label());
                    let report = orchestrator.remove(&target, cb, cancel.clone()).await;
                    done.push((i, report));
                }
                done
            }
        })
        .buffer_unordered(concurrency)
        .flat_map(stream::iter)
        .collect()
        .await;

    reports.sort_by_key(|(i, _)| *i);
    debug!("批量卸载完成，用时: {:?}", start.elapsed());
    reports.into_iter().map(|(_, r)| r).collect()
}
