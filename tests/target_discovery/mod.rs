use std::collections::HashSet;
use std::sync::Arc;

use topowatch::MemoryTopo;
use topowatch::Settings;
use topowatch::TabletType;
use topowatch::Target;
use topowatch::TargetDiscovery;

use crate::common::*;

#[tokio::test]
async fn test_find_all_targets_over_cell() {
    let topo = MemoryTopo::new(&[CELL]);
    topo.update_srv_keyspace(CELL, "ks1", primary_only(&["-80", "80-"])).unwrap();
    topo.update_srv_keyspace(CELL, "lookup", primary_only(&["0"])).unwrap();
    let settings = Settings::default().validate().unwrap();
    let discovery = TargetDiscovery::new(Arc::new(topo), &settings);

    let targets = discovery
        .find_all_targets(CELL, &[], &[TabletType::Primary, TabletType::Replica])
        .await
        .unwrap();
    let targets: HashSet<Target> = targets.into_iter().collect();

    assert_eq!(targets.len(), 6);
    assert!(targets.contains(&primary("ks1", "-80")));
    assert!(targets.contains(&Target::new(CELL, "lookup", "0", TabletType::Replica)));
}
