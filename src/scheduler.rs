//! Cell scheduling over one session.
//!
//! Both roles reduce to two dual primitives:
//!
//! - [`distribute`]: cells queued on the base sub-circuit are handed out,
//!   one per consumed instruction ID, onto the instructed sub-circuit
//!   (client-outbound, middle-inbound).
//! - [`merge`]: cells queued on their arrival sub-circuit are released onto
//!   the base in instruction order, waiting out inter-sub-circuit skew
//!   (client-inbound, middle-outbound).

use crate::cell::Cell;
use crate::session::Session;
use crate::{CircuitId, Direction, Error, SubcircId};

/// A cell the caller must put on `circuit`'s outbound queue.
#[derive(Debug)]
pub(crate) struct Forward {
    pub(crate) circuit: CircuitId,
    pub(crate) cell: Cell,
}

/// Park `cell` on sub-circuit `id`'s reorder buffer.
pub(crate) fn buffer_cell(
    session: &mut Session,
    id: SubcircId,
    cell: &Cell,
    direction: Direction,
    now: u32,
) -> Result<(), Error> {
    let sub = session
        .subcircs
        .get_mut(id)
        .ok_or(Error::Protocol("cell arrived on an unknown sub-circuit"))?;

    sub.buffer.append(cell, direction, now);

    Ok(())
}

/// Drain the base buffer, forwarding each cell on the next instructed
/// sub-circuit.
pub(crate) fn distribute(
    session: &mut Session,
    direction: Direction,
    out: &mut Vec<Forward>,
) -> Result<(), Error> {
    loop {
        let queued = session
            .subcircs
            .get(SubcircId::BASE)
            .map(|base| base.buffer.head_direction() == Some(direction))
            .unwrap_or(false);
        if !queued {
            return Ok(());
        }

        let id = match session.next_subcirc(direction) {
            Ok(id) => id,
            Err(Error::NoActiveInstruction) => {
                tracing::info!(
                    "No active {direction} instruction for {}, leaving cells buffered",
                    session.id
                );
                return Ok(());
            }
            Err(Error::SessionClosing) => return Ok(()),
            Err(e) => return Err(e),
        };

        let Some(target) = session.subcircs.get(id).map(|sub| sub.circuit) else {
            return Err(Error::Protocol(
                "instruction references an unknown sub-circuit",
            ));
        };

        let Some(cell) = session
            .subcircs
            .get_mut(SubcircId::BASE)
            .and_then(|base| base.buffer.pop(direction))
        else {
            return Ok(());
        };

        out.push(Forward {
            circuit: target,
            cell,
        });
        session.used_subcirc(direction);
    }
}

/// Release buffered cells onto the base in instruction order.
///
/// Stops as soon as the instructed sub-circuit has nothing buffered yet;
/// the pick stays sticky so the next arrival resumes exactly there.
pub(crate) fn merge(
    session: &mut Session,
    direction: Direction,
    out: &mut Vec<Cell>,
) -> Result<(), Error> {
    loop {
        let id = match session.next_subcirc(direction) {
            Ok(id) => id,
            Err(Error::NoActiveInstruction) => {
                tracing::info!(
                    "No active {direction} instruction for {}, leaving cells buffered",
                    session.id
                );
                return Ok(());
            }
            Err(Error::SessionClosing) => return Ok(()),
            Err(e) => return Err(e),
        };

        let Some(sub) = session.subcircs.get_mut(id) else {
            return Err(Error::Protocol(
                "instruction references an unknown sub-circuit",
            ));
        };

        let Some(cell) = sub.buffer.pop(direction) else {
            return Ok(());
        };

        out.push(cell);
        session.used_subcirc(direction);
    }
}
