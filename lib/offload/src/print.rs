// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Print offload state in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both an embedding daemon and integration tests.

use crate::api::BoundedCount;
use crate::api::FrontEndDump;
use crate::engine::conn::Conn;
use crate::engine::conn::Endpoint;
use crate::engine::session::OffloadStatsSnap;
use std::io::Write;
use std::sync::Arc;
use tabwriter::TabWriter;

/// Print a [`FrontEndDump`].
pub fn print_front_end(dump: &FrontEndDump) -> std::io::Result<()> {
    print_front_end_into(&mut std::io::stdout(), dump)
}

/// Print a [`FrontEndDump`] into a given writer.
pub fn print_front_end_into(
    writer: &mut impl Write,
    dump: &FrontEndDump,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Flow {}", dump.serial)?;
    write_hrb(&mut t)?;
    writeln!(t, "MODE\t{}", dump.mode)?;
    writeln!(t, "CAN ACCEL\t{}", dump.can_accel)?;
    writeln!(t, "DECEL PENDING\t{}", dump.decelerate_pending)?;
    writeln!(t, "FLUSHES\t{}", dump.flush_happened_total)?;
    t.flush()?;

    writeln!(t, "\nCOUNTER\tCOUNT\tLIMIT\tTOTAL")?;
    write_hr(&mut t)?;
    print_bounded(&mut t, "no action", &dump.no_action_seen)?;
    print_bounded(&mut t, "driver fail", &dump.driver_fail)?;
    print_bounded(&mut t, "engine nack", &dump.ae_nack)?;
    t.flush()
}

fn print_bounded(
    t: &mut impl Write,
    name: &str,
    bc: &BoundedCount,
) -> std::io::Result<()> {
    writeln!(t, "{name}\t{}\t{}\t{}", bc.count, bc.limit, bc.total)
}

/// Print an [`OffloadStatsSnap`].
pub fn print_stats(stats: &OffloadStatsSnap) -> std::io::Result<()> {
    print_stats_into(&mut std::io::stdout(), stats)
}

/// Print an [`OffloadStatsSnap`] into a given writer.
pub fn print_stats_into(
    writer: &mut impl Write,
    s: &OffloadStatsSnap,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Acceleration")?;
    write_hr(&mut t)?;
    writeln!(t, "accelerated\t{}", s.accelerated)?;
    writeln!(t, "  ported\t{}", s.ported_accelerated)?;
    writeln!(t, "  non-ported\t{}", s.non_ported_accelerated)?;
    writeln!(t, "pending accel\t{}", s.accel_pending)?;
    writeln!(t, "pending decel\t{}", s.pending_decel)?;
    writeln!(t, "limited\t{}", s.accel_limited)?;
    t.flush()?;

    writeln!(t, "\nFailures")?;
    write_hr(&mut t)?;
    writeln!(t, "rule invalid\t{}", s.rule_invalid)?;
    writeln!(t, "stale topology\t{}", s.stale_topology)?;
    writeln!(t, "driver fail\t{}", s.driver_fail)?;
    writeln!(t, "engine nack\t{}", s.ae_nack)?;
    writeln!(t, "flush\t{}", s.flush)?;
    writeln!(t, "ceased\t{}", s.ceased)?;
    t.flush()?;

    writeln!(t, "\nCommands\tCOUNT\tAVG MS")?;
    write_hr(&mut t)?;
    let create_avg = avg(s.accel_cmd_ms, s.accel_cmds);
    let destroy_avg = avg(s.decel_cmd_ms, s.decel_cmds);
    writeln!(t, "create\t{}\t{create_avg}", s.accel_cmds)?;
    writeln!(t, "destroy\t{}\t{destroy_avg}", s.decel_cmds)?;
    t.flush()?;

    writeln!(t, "\nFlows")?;
    write_hr(&mut t)?;
    writeln!(t, "created\t{}", s.flows_created)?;
    writeln!(t, "expired\t{}", s.flows_expired)?;
    writeln!(t, "pkts\t{}", s.pkts_processed)?;
    writeln!(t, "dropped\t{}", s.pkts_dropped)?;
    t.flush()
}

fn avg(total: u64, n: u64) -> u64 {
    total.checked_div(n).unwrap_or(0)
}

/// Print the flows of a session.
pub fn print_flows(flows: &[Arc<Conn>]) -> std::io::Result<()> {
    print_flows_into(&mut std::io::stdout(), flows)
}

/// Print the flows of a session into a given writer.
pub fn print_flows_into(
    writer: &mut impl Write,
    flows: &[Arc<Conn>],
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);
    writeln!(t, "SERIAL\tPROTO\tFROM\tTO\tDIR\tTIMER\tMODE\tPKTS\tBYTES")?;

    for conn in flows {
        let tuple = conn.tuple();
        let totals = conn.totals();
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            conn.serial(),
            tuple.proto,
            endpoint(&tuple.from),
            endpoint(&tuple.to),
            conn.direction(),
            conn.timer_group(),
            conn.fe().mode(),
            totals.from_pkts + totals.to_pkts,
            totals.bytes,
        )?;
    }
    t.flush()
}

fn endpoint(ep: &Endpoint) -> std::string::String {
    match ep.addr {
        std::net::IpAddr::V4(ip) => format!("{ip}:{}", ep.port),
        std::net::IpAddr::V6(ip) => format!("[{ip}]:{}", ep.port),
    }
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
