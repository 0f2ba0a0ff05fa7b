use drift_protocol::{AgentRecord, InterceptRecord};
use prettytable::{row, Table};

pub fn intercepts(records: &[InterceptRecord]) {
    let mut table = Table::new();
    table.set_titles(row!["NAME", "WORKLOAD", "TARGET", "DISPOSITION", "MOUNT"]);
    for record in records {
        table.add_row(row![
            record.name,
            format!("{}/{}", record.workload_namespace, record.workload_name),
            format!("{}:{}", record.target_host, record.target_port),
            record.disposition,
            record.mount_point.as_deref().unwrap_or("-"),
        ]);
    }
    table.printstd();
}

pub fn agents(records: &[AgentRecord]) {
    let mut table = Table::new();
    table.set_titles(row!["NAME", "NAMESPACE", "SFTP PORT", "FTP PORT"]);
    for record in records {
        table.add_row(row![record.name, record.namespace, record.sftp_port, record.ftp_port]);
    }
    table.printstd();
}
