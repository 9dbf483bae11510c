use crate::error::ReadStat;
use crate::experts::WorkerContext;
use crate::message::{Message, Payload};
use crate::types::{Direction, Eid, Value, Vid};

fn direction_of(code: i64) -> Direction {
    match code {
        0 => Direction::In,
        1 => Direction::Out,
        _ => Direction::Both,
    }
}

/// `in/out/both[E|V]`: expands each input element over the topology rows,
/// grouping outputs by input history. Edge-to-vertex hops are computed from
/// the eid alone.
pub fn process(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex_input = op.param_int(0) == 0;
    let edge_output = op.param_int(1) == 1;
    let direction = direction_of(op.param_int(2));
    let label = op.param_int(3) as i32;
    let trx_id = plan.trx_id;
    let bt = plan.bt;
    let read_only = plan.read_only();

    let mut out = Payload::new();
    let mut reads = 0usize;
    for (history, values) in &msg.data {
        let mut bucket: Vec<Value> = Vec::new();
        for value in values {
            if vertex_input {
                let Ok(vid) = value.as_u64() else { continue };
                let vid = Vid(vid as u32);
                reads += 1;
                if edge_output {
                    match ctx
                        .storage
                        .get_connected_edges(tid, vid, label, direction, trx_id, bt, read_only)
                    {
                        ReadStat::Success(eids) => bucket
                            .extend(eids.into_iter().map(|e| Value::Int(e.value() as i64))),
                        ReadStat::NotFound => {}
                        ReadStat::Abort => {
                            ctx.abort_query(tid, &msg, "read conflict during traversal");
                            return;
                        }
                    }
                } else {
                    match ctx
                        .storage
                        .get_connected_vertices(tid, vid, label, direction, trx_id, bt, read_only)
                    {
                        ReadStat::Success(vids) => {
                            bucket.extend(vids.into_iter().map(|v| Value::Int(v.0 as i64)))
                        }
                        ReadStat::NotFound => {}
                        ReadStat::Abort => {
                            ctx.abort_query(tid, &msg, "read conflict during traversal");
                            return;
                        }
                    }
                }
            } else {
                // edge input: endpoints decode straight out of the id
                let Ok(packed) = value.as_u64() else { continue };
                let eid = Eid::from_value(packed);
                match direction {
                    Direction::Out => bucket.push(Value::Int(eid.out_v.0 as i64)),
                    Direction::In => bucket.push(Value::Int(eid.in_v.0 as i64)),
                    Direction::Both => {
                        bucket.push(Value::Int(eid.out_v.0 as i64));
                        bucket.push(Value::Int(eid.in_v.0 as i64));
                    }
                }
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.push_rw_record(trx_id, reads, true);

    ctx.forward(tid, &msg, out);
}
