use stagehand::queue::{parse_qsub_id, qstat_reports_running};

#[test]
fn qsub_output_yields_the_numeric_id() {
    assert_eq!(
        parse_qsub_id("4819103.cluster-head.example.edu\n"),
        Some("4819103".to_string())
    );
    assert_eq!(parse_qsub_id("512\n"), Some("512".to_string()));
    assert_eq!(parse_qsub_id(""), None);
    assert_eq!(parse_qsub_id("   \n"), None);
}

const QSTAT: &str = "\
Job ID        Name          User      Time Use  S  Queue
------------  ------------  --------  --------  -  ------
4819103.head  stagehand_0   someuser  00:01:13  R  normal
4819104.head  stagehand_1   someuser  00:00:00  Q  normal
4819105.head  stagehand_2   someuser  01:13:37  C  normal
";

#[test]
fn running_and_queued_entries_count_as_alive() {
    let running = vec!["4819103".to_string()];
    assert!(qstat_reports_running(QSTAT, &running));

    let queued = vec!["4819104".to_string()];
    assert!(qstat_reports_running(QSTAT, &queued));

    // Any live id among a stage's history is enough.
    let mixed = vec!["4819105".to_string(), "4819104".to_string()];
    assert!(qstat_reports_running(QSTAT, &mixed));
}

#[test]
fn completed_or_absent_entries_do_not() {
    let completed = vec!["4819105".to_string()];
    assert!(!qstat_reports_running(QSTAT, &completed));

    let absent = vec!["999".to_string()];
    assert!(!qstat_reports_running(QSTAT, &absent));

    assert!(!qstat_reports_running("", &completed));
}
