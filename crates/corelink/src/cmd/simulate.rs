use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use corelink_msg::{DataFormat, EndpointId, Role, Status, TransformId};
use corelink_proto::ProtoError;

use crate::cmd::SimulateArgs;
use crate::exit::{proto_error, CliError, CliResult, FAILURE, SUCCESS, USAGE};
use crate::output::OutputFormat;
use crate::sim::{CorePair, HostStats, TraceEntry};

#[derive(Serialize)]
struct SimulateOutput {
    transforms: Vec<u16>,
    connect_status: &'static str,
    disconnected: Option<usize>,
    messages: Vec<TraceEntry>,
    core0: HostStats,
    core1: HostStats,
}

pub fn run(args: SimulateArgs, format: OutputFormat) -> CliResult<i32> {
    if args.transforms == 0 || args.transforms > 8 {
        return Err(CliError::new(USAGE, "--transforms must be between 1 and 8"));
    }
    let mut pair = CorePair::new(args.buffer_size, args.metadata);
    let sync = args.transforms > 1;

    // Operator terminals on core 0 feed sibling terminals on core 1.
    let mut connected: Vec<TransformId> = Vec::new();
    for t in 0..args.transforms {
        let source = EndpointId(0x4040 | t);
        let sink = EndpointId(0x8040 | t).shadow();
        let result: Rc<RefCell<Option<(Status, TransformId)>>> = Rc::new(RefCell::new(None));
        let out = result.clone();
        pair.p0
            .connect(
                source,
                sink,
                Role::RemoteSink,
                DataFormat::Pcm32,
                sync,
                Box::new(move |status, id| *out.borrow_mut() = Some((status, id))),
            )
            .map_err(|e| proto_error("connect", e))?;
        pair.pump().map_err(|e| proto_error("pump", e))?;
        let (status, id) = result
            .borrow()
            .ok_or_else(|| CliError::new(FAILURE, "connect sequence did not complete"))?;
        if !status.is_ok() {
            return Err(proto_error("connect", ProtoError::PeerRejected(status)));
        }
        connected.push(id);
    }

    let mut disconnected = None;
    if args.disconnect {
        let result: Rc<RefCell<Option<(Status, usize)>>> = Rc::new(RefCell::new(None));
        let out = result.clone();
        pair.p0
            .disconnect(
                &connected,
                Box::new(move |status, count| *out.borrow_mut() = Some((status, count))),
            )
            .map_err(|e| proto_error("disconnect", e))?;
        pair.pump().map_err(|e| proto_error("pump", e))?;
        let (status, count) = result
            .borrow()
            .ok_or_else(|| CliError::new(FAILURE, "disconnect sequence did not complete"))?;
        if !status.is_ok() {
            return Err(proto_error("disconnect", ProtoError::PeerRejected(status)));
        }
        disconnected = Some(count);
    }

    let output = SimulateOutput {
        transforms: connected.iter().map(|id| id.0).collect(),
        connect_status: "ok",
        disconnected,
        messages: pair.trace(),
        core0: pair.stats(0),
        core1: pair.stats(1),
    };
    print_output(&output, format)?;
    Ok(SUCCESS)
}

fn print_output(output: &SimulateOutput, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => {
            let out = serde_json::to_string(output)
                .map_err(|e| CliError::new(FAILURE, format!("encoding output: {e}")))?;
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for entry in &output.messages {
                let (from, to) = if entry.from == 0 { (0, 1) } else { (1, 0) };
                println!("p{from} -> p{to}  {}", entry.kind);
            }
            println!("connected transforms: {:?}", output.transforms);
            if let Some(count) = output.disconnected {
                println!("disconnected: {count}");
            }
            println!(
                "core0: {} connects, {} disconnects, {} faults",
                output.core0.connects, output.core0.disconnects, output.core0.faults
            );
            println!(
                "core1: {} connects, {} disconnects, {} faults",
                output.core1.connects, output.core1.disconnects, output.core1.faults
            );
        }
    }
    Ok(())
}
