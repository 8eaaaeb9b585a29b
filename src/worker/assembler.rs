use crate::error::AssemblyError;

use std::collections::{BTreeSet, HashMap, HashSet};

/// Services the host can provide to plugins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
	Storage,
	Transport,
	KeyChain,
	Events,
	Mediator,
	ChainTip,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
	Capability(Capability),
	/// Another plugin that must be placed earlier
	Plugin(&'static str),
}

/// Placement relative to other plugins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectionOrder {
	pub before: Option<&'static str>,
	pub after: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
	pub name: &'static str,
	pub dependencies: Vec<Dependency>,
	pub order: InjectionOrder,
}

/// Validates plugin dependencies and computes the start order.
///
/// Plugin dependencies are ordered first, ties broken by registration order; a dependency cycle
/// is a conflicting order. A single placement pass then moves each plugin with a `before`/`after`
/// constraint, in registration order, next to its target. An `after` target placed later than the
/// `before` target, or a constraint a later placement breaks, is a conflicting order.
pub struct PluginAssembler<T> {
	provided: HashSet<Capability>,
	plugins: Vec<(PluginDescriptor, T)>,
}

impl<T> PluginAssembler<T> {
	pub fn new(provided: impl IntoIterator<Item = Capability>) -> Self {
		Self {
			provided: provided.into_iter().collect(),
			plugins: Vec::new(),
		}
	}

	pub fn register(&mut self, descriptor: PluginDescriptor, plugin: T) {
		self.plugins.push((descriptor, plugin));
	}

	pub fn assemble(self) -> Result<Vec<(PluginDescriptor, T)>, AssemblyError> {
		let mut index: HashMap<&'static str, usize> = HashMap::new();
		for (position, (descriptor, _)) in self.plugins.iter().enumerate() {
			if index.insert(descriptor.name, position).is_some() {
				return Err(AssemblyError::DuplicatePlugin(descriptor.name.to_string()));
			}
		}

		let resolve = |plugin: &str, name: &str| {
			index
				.get(name)
				.copied()
				.ok_or_else(|| AssemblyError::UnknownDependency {
					plugin: plugin.to_string(),
					dependency: name.to_string(),
				})
		};

		// edges[a] holds the plugins that depend on a
		let mut edges: Vec<Vec<usize>> = vec![Vec::new(); self.plugins.len()];
		let mut incoming = vec![0usize; self.plugins.len()];
		for (position, (descriptor, _)) in self.plugins.iter().enumerate() {
			for dependency in &descriptor.dependencies {
				match dependency {
					Dependency::Capability(capability) => {
						if !self.provided.contains(capability) {
							return Err(AssemblyError::UnknownDependency {
								plugin: descriptor.name.to_string(),
								dependency: format!("{:?}", capability),
							});
						}
					}
					Dependency::Plugin(name) => {
						let other = resolve(descriptor.name, name)?;
						edges[other].push(position);
						incoming[position] += 1;
					}
				}
			}
			if let Some(after) = descriptor.order.after {
				resolve(descriptor.name, after)?;
			}
			if let Some(before) = descriptor.order.before {
				resolve(descriptor.name, before)?;
			}
		}

		let mut ready: BTreeSet<usize> = (0..self.plugins.len())
			.filter(|position| incoming[*position] == 0)
			.collect();
		let mut order = Vec::with_capacity(self.plugins.len());
		while let Some(position) = ready.pop_first() {
			order.push(position);
			for next in &edges[position] {
				incoming[*next] -= 1;
				if incoming[*next] == 0 {
					ready.insert(*next);
				}
			}
		}

		if order.len() != self.plugins.len() {
			let placed: HashSet<usize> = order.iter().copied().collect();
			let conflicting: Vec<&str> = self
				.plugins
				.iter()
				.enumerate()
				.filter(|(position, _)| !placed.contains(position))
				.map(|(_, (descriptor, _))| descriptor.name)
				.collect();
			return Err(AssemblyError::ConflictingOrder(conflicting.join(", ")));
		}

		let place = |order: &[usize], name: Option<&'static str>| {
			name.and_then(|name| order.iter().position(|position| *position == index[name]))
		};
		for (position, (descriptor, _)) in self.plugins.iter().enumerate() {
			let InjectionOrder { before, after } = descriptor.order;
			if before.is_none() && after.is_none() {
				continue;
			}
			order.retain(|placed| *placed != position);
			let slot = match (place(&order, after), place(&order, before)) {
				(Some(after_index), Some(before_index)) if after_index >= before_index => {
					return Err(AssemblyError::ConflictingOrder(format!(
						"{} after {} and before {}",
						descriptor.name,
						after.unwrap_or_default(),
						before.unwrap_or_default()
					)));
				}
				(Some(after_index), _) => after_index + 1,
				(None, Some(before_index)) => before_index,
				(None, None) => order.len(),
			};
			order.insert(slot, position);
		}

		let rank: HashMap<usize, usize> = order
			.iter()
			.enumerate()
			.map(|(rank, position)| (*position, rank))
			.collect();
		for (position, (descriptor, _)) in self.plugins.iter().enumerate() {
			let earlier = descriptor
				.dependencies
				.iter()
				.filter_map(|dependency| match dependency {
					Dependency::Plugin(name) => Some(*name),
					Dependency::Capability(_) => None,
				})
				.chain(descriptor.order.after);
			for name in earlier {
				if rank[&index[name]] > rank[&position] {
					return Err(AssemblyError::ConflictingOrder(format!(
						"{} after {}",
						descriptor.name, name
					)));
				}
			}
			if let Some(name) = descriptor.order.before {
				if rank[&index[name]] < rank[&position] {
					return Err(AssemblyError::ConflictingOrder(format!(
						"{} before {}",
						descriptor.name, name
					)));
				}
			}
		}

		let mut slots: Vec<Option<(PluginDescriptor, T)>> =
			self.plugins.into_iter().map(Some).collect();
		Ok(order
			.into_iter()
			.filter_map(|position| slots[position].take())
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn plugin(
		name: &'static str,
		dependencies: Vec<Dependency>,
		before: Option<&'static str>,
		after: Option<&'static str>,
	) -> PluginDescriptor {
		PluginDescriptor {
			name,
			dependencies,
			order: InjectionOrder { before, after },
		}
	}

	fn names(assembled: &[(PluginDescriptor, ())]) -> Vec<&'static str> {
		assembled.iter().map(|(d, _)| d.name).collect()
	}

	#[test]
	fn registration_order_is_kept_without_constraints() {
		let mut assembler = PluginAssembler::new([Capability::Storage]);
		assembler.register(plugin("a", vec![], None, None), ());
		assembler.register(plugin("b", vec![], None, None), ());
		assembler.register(
			plugin("c", vec![Dependency::Capability(Capability::Storage)], None, None),
			(),
		);
		assert_eq!(names(&assembler.assemble().unwrap()), vec!["a", "b", "c"]);
	}

	#[test]
	fn before_and_after_constraints_reorder_plugins() {
		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("transactions", vec![], None, Some("headers")), ());
		assembler.register(plugin("storage", vec![], None, None), ());
		assembler.register(plugin("headers", vec![], Some("storage"), None), ());
		assert_eq!(
			names(&assembler.assemble().unwrap()),
			vec!["headers", "storage", "transactions"]
		);
	}

	#[test]
	fn plugin_dependency_is_placed_first() {
		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("b", vec![Dependency::Plugin("a")], None, None), ());
		assembler.register(plugin("a", vec![], None, None), ());
		assert_eq!(names(&assembler.assemble().unwrap()), vec!["a", "b"]);
	}

	#[test]
	fn unknown_dependency_is_fatal() {
		let mut assembler = PluginAssembler::new([Capability::Storage]);
		assembler.register(
			plugin("a", vec![Dependency::Capability(Capability::KeyChain)], None, None),
			(),
		);
		assert_eq!(
			assembler.assemble().unwrap_err(),
			AssemblyError::UnknownDependency {
				plugin: "a".to_string(),
				dependency: "KeyChain".to_string(),
			}
		);

		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("a", vec![], Some("missing"), None), ());
		assert!(matches!(
			assembler.assemble(),
			Err(AssemblyError::UnknownDependency { .. })
		));
	}

	#[test]
	fn conflicting_order_is_fatal() {
		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("a", vec![], Some("b"), None), ());
		assembler.register(plugin("b", vec![], Some("a"), None), ());
		assembler.register(plugin("c", vec![], None, None), ());
		assert_eq!(
			assembler.assemble().unwrap_err(),
			AssemblyError::ConflictingOrder("a before b".to_string())
		);
	}

	#[test]
	fn after_target_placed_past_before_target_is_fatal() {
		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("a", vec![], None, None), ());
		assembler.register(plugin("b", vec![], None, None), ());
		assembler.register(plugin("x", vec![], Some("a"), Some("b")), ());
		assert_eq!(
			assembler.assemble().unwrap_err(),
			AssemblyError::ConflictingOrder("x after b and before a".to_string())
		);

		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("a", vec![], None, None), ());
		assembler.register(plugin("b", vec![], None, None), ());
		assembler.register(plugin("x", vec![], Some("b"), Some("a")), ());
		assert_eq!(names(&assembler.assemble().unwrap()), vec!["a", "x", "b"]);
	}

	#[test]
	fn placement_breaking_a_dependency_is_fatal() {
		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("b", vec![Dependency::Plugin("a")], Some("a"), None), ());
		assembler.register(plugin("a", vec![], None, None), ());
		assert_eq!(
			assembler.assemble().unwrap_err(),
			AssemblyError::ConflictingOrder("b after a".to_string())
		);
	}

	#[test]
	fn dependency_cycle_is_fatal() {
		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("a", vec![Dependency::Plugin("b")], None, None), ());
		assembler.register(plugin("b", vec![Dependency::Plugin("a")], None, None), ());
		assembler.register(plugin("c", vec![], None, None), ());
		assert_eq!(
			assembler.assemble().unwrap_err(),
			AssemblyError::ConflictingOrder("a, b".to_string())
		);
	}

	#[test]
	fn duplicate_names_are_rejected() {
		let mut assembler = PluginAssembler::new([]);
		assembler.register(plugin("a", vec![], None, None), ());
		assembler.register(plugin("a", vec![], None, None), ());
		assert_eq!(
			assembler.assemble().unwrap_err(),
			AssemblyError::DuplicatePlugin("a".to_string())
		);
	}
}
