pub mod tests {
    use crate::{ResourceRecord, StateBlob, STACK_RESOURCE_TYPE};

    pub const TEST_APP: &str = "shop";
    pub const TEST_ENV: &str = "dev";

    pub fn test_urn(resource_type: &str, name: &str) -> String {
        format!(
            "urn:pulumi:{}::{}::{}::{}",
            TEST_ENV, TEST_APP, resource_type, name
        )
    }

    /// `a` owns `b`; `c` points at a parent that is not in the state.
    pub fn mock_broken_state() -> StateBlob {
        StateBlob::new(
            TEST_ENV,
            vec![
                ResourceRecord::new("a", "t"),
                ResourceRecord::new("b", "t").with_parent("a"),
                ResourceRecord::new("c", "t").with_parent("x"),
            ],
        )
    }

    /// A stack with a function, its role and a bucket the function reads.
    pub fn mock_app_state() -> StateBlob {
        let stack = test_urn(STACK_RESOURCE_TYPE, "shop-dev");
        let bucket = test_urn("aws:s3/bucket:Bucket", "assets");
        let role = test_urn("aws:iam/role:Role", "orders-role");
        let function = test_urn("aws:lambda/function:Function", "orders");
        StateBlob::new(
            TEST_ENV,
            vec![
                ResourceRecord::new(&stack, STACK_RESOURCE_TYPE),
                ResourceRecord::new(&bucket, "aws:s3/bucket:Bucket").with_parent(&stack),
                ResourceRecord::new(&role, "aws:iam/role:Role").with_parent(&stack),
                ResourceRecord::new(&function, "aws:lambda/function:Function")
                    .with_parent(&stack)
                    .with_dependencies(&[&role, &bucket])
                    .with_property_dependency("role", &[&role])
                    .with_property_dependency("environment", &[&bucket]),
            ],
        )
    }

    /// A chain `r0 <- r1 <- ... <- r{depth}` where each resource is the
    /// parent of the next.
    pub fn mock_parent_chain(depth: usize) -> StateBlob {
        let mut resources = vec![ResourceRecord::new("r0", "t")];
        for i in 1..=depth {
            resources.push(
                ResourceRecord::new(&format!("r{}", i), "t").with_parent(&format!("r{}", i - 1)),
            );
        }
        StateBlob::new(TEST_ENV, resources)
    }
}
