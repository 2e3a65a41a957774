use super::{ClassId, Interface};
use crate::{
    error::{Error, Result},
    filter::{relation, FilterRelation, FilterSpec},
};

/// Checks a new filter against every filter of the interface and returns the position it takes
/// in the rule order.
///
/// For each existing filter, whichever of the two has the lower rule number is the front one
/// (the existing filter on ties). A front filter that is a superset of the back one leaves the
/// back one unreachable, which is always a configuration mistake.
pub(super) fn insert_position(
    iface: &Interface,
    class: ClassId,
    name: &str,
    spec: &FilterSpec,
) -> Result<usize> {
    let mut position = 0;

    for (i, existing) in iface.filters().enumerate() {
        let new_first = existing.spec.rule > spec.rule;
        if !new_first {
            position = i + 1;
        }

        let (front, back) = if new_first { (spec, &existing.spec) } else { (&existing.spec, spec) };
        let (front_class, back_class) =
            if new_first { (class, existing.class) } else { (existing.class, class) };
        let quiet = front.dont_warn || back.dont_warn;

        match relation(&front.flow, &back.flow) {
            FilterRelation::Superset => {
                if !quiet {
                    tracing::error!(
                        interface = %iface.name,
                        front = %class_name(iface, front_class),
                        front_line = ?front.line,
                        back = %class_name(iface, back_class),
                        back_line = ?back.line,
                        "filters have an order problem, the second one never matches"
                    );
                }
                return Err(Error::FilterShadow {
                    filter: name.to_owned(),
                    existing: existing.name.clone(),
                });
            }
            FilterRelation::Intersect if front_class != back_class && !quiet => {
                tracing::warn!(
                    interface = %iface.name,
                    front = %class_name(iface, front_class),
                    front_line = ?front.line,
                    back = %class_name(iface, back_class),
                    back_line = ?back.line,
                    "filters intersect, the first one could override the second one"
                );
            }
            _ => {}
        }
    }

    Ok(position)
}

fn class_name(iface: &Interface, id: ClassId) -> &str {
    iface.classes.get(id).map_or("?", |c| c.name())
}
